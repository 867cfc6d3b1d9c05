//! Repository layer
//!
//! Collaborators the controller talks to, all behind traits so the
//! controller never depends on how builds are stored or how pods reach
//! the cluster:
//! - Build source, lookup and updater (the build store)
//! - Pod source (the change feed of observed pods)
//! - Pod creator (cluster submission)

mod builds;
mod pods;

// Re-export traits
pub use builds::{BuildLookup, BuildSource, BuildUpdater};
pub use pods::{PodCreator, PodSource};

// Re-export implementations
pub use builds::MemoryBuildStore;
pub use pods::MemoryPodQueue;
