//! Build controller
//!
//! Drives a build through its lifecycle:
//!
//! ```text
//! New -> Pending -> Running -> Complete
//!  |        |          |
//!  +--------+----------+-----> Failed
//! ```
//!
//! `handle_build` materializes a pod for a `New` build. `handle_pod` folds an
//! observed pod state back into its build. Both are safe to call repeatedly
//! with the same input: anything that is not a forward transition is a no-op.
//!
//! Every failure is resolved into the returned build. Persistence is best
//! effort: a failed update is reported in the [`Reconciliation`] but the
//! in-memory transition stands, and retrying it is the caller's business.
//! A write computed from a stale copy of the build is refused by the store
//! with a conflict, so replayed events cannot override newer state.

use kiln_core::domain::build::{Build, BuildStatus};
use kiln_core::domain::pod::{Pod, PodCondition};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ControllerError, StoreError};
use crate::repository::{BuildLookup, BuildUpdater, PodCreator};
use crate::strategy::BuildPodStrategy;

/// Outcome of handling one build or pod event
#[derive(Debug)]
pub struct Reconciliation {
    /// The build after the transition, authoritative for this run
    pub build: Build,
    /// Status before the event was handled
    pub previous: BuildStatus,
    /// Why the build failed, when this event failed it
    pub cause: Option<ControllerError>,
    /// Set when the transition could not be persisted
    pub persist_error: Option<StoreError>,
}

impl Reconciliation {
    fn unchanged(build: Build) -> Self {
        Self {
            previous: build.status,
            build,
            cause: None,
            persist_error: None,
        }
    }

    /// Whether the event moved the build
    pub fn changed(&self) -> bool {
        self.previous != self.build.status
    }
}

pub struct BuildController {
    strategy: Arc<dyn BuildPodStrategy>,
    pod_creator: Arc<dyn PodCreator>,
    updater: Arc<dyn BuildUpdater>,
    lookup: Arc<dyn BuildLookup>,
}

impl BuildController {
    pub fn new(
        strategy: Arc<dyn BuildPodStrategy>,
        pod_creator: Arc<dyn PodCreator>,
        updater: Arc<dyn BuildUpdater>,
        lookup: Arc<dyn BuildLookup>,
    ) -> Self {
        Self {
            strategy,
            pod_creator,
            updater,
            lookup,
        }
    }

    /// Handles a build event
    ///
    /// Only `New` builds are acted on: the build's pod is created and the
    /// build moves to `Pending`, or to `Failed` if the pod could not be
    /// produced or submitted. Any other status is returned untouched.
    pub async fn handle_build(&self, mut build: Build) -> Reconciliation {
        if build.status != BuildStatus::New {
            debug!(
                "Build {} is {}, nothing to do",
                build.name, build.status
            );
            return Reconciliation::unchanged(build);
        }

        let previous = build.status;

        let cause = match self.create_build_pod(&build).await {
            Ok(pod_name) => {
                debug!("Created pod {} for build {}", pod_name, build.name);
                build.pod_name = Some(pod_name);
                build.message = None;
                build.transition_to(BuildStatus::Pending);
                None
            }
            Err(e) => {
                build.message = Some(e.to_string());
                build.transition_to(BuildStatus::Failed);
                Some(e)
            }
        };

        let persist_error = self.persist(&mut build).await;

        Reconciliation {
            build,
            previous,
            cause,
            persist_error,
        }
    }

    /// Handles a pod event
    ///
    /// Returns `Ok(None)` when the pod belongs to no known build. `Err` is
    /// only returned when the owning build could not be looked up.
    pub async fn handle_pod(&self, pod: &Pod) -> Result<Option<Reconciliation>, ControllerError> {
        let Some(mut build) = self
            .lookup
            .find_by_pod_name(&pod.namespace, &pod.name)
            .await?
        else {
            debug!("Pod {} belongs to no known build, ignoring", pod.name);
            return Ok(None);
        };

        let previous = build.status;

        let Some(next) = next_status(previous, pod.current_state.status) else {
            debug!(
                "Build {} is {} and pod {} is {}, nothing to do",
                build.name, previous, pod.name, pod.current_state.status
            );
            return Ok(Some(Reconciliation::unchanged(build)));
        };

        if next == BuildStatus::Failed {
            build.message = Some(format!(
                "pod {} failed with exit codes {:?}",
                pod.name,
                pod.exit_codes()
            ));
        }
        build.transition_to(next);

        debug!(
            "Build {} moving from {} to {} (pod {} is {})",
            build.name, previous, next, pod.name, pod.current_state.status
        );

        let persist_error = self.persist(&mut build).await;

        Ok(Some(Reconciliation {
            build,
            previous,
            cause: None,
            persist_error,
        }))
    }

    /// Produces the build's pod and submits it, returning the pod name
    async fn create_build_pod(&self, build: &Build) -> Result<String, ControllerError> {
        let pod = self.strategy.create_build_pod(build)?;
        let pod_name = pod.name.clone();

        self.pod_creator.create_pod(&build.namespace, pod).await?;

        Ok(pod_name)
    }

    /// Best-effort write of the build; on success `build` becomes the stored copy
    async fn persist(&self, build: &mut Build) -> Option<StoreError> {
        match self.updater.update_build(build.clone()).await {
            Ok(stored) => {
                *build = stored;
                None
            }
            Err(e) => {
                warn!(
                    "Failed to persist build {} as {}: {}",
                    build.name, build.status, e
                );
                Some(e)
            }
        }
    }
}

/// Status a build moves to when its pod is observed in `pod`
///
/// `None` means no transition.
pub fn next_status(build: BuildStatus, pod: PodCondition) -> Option<BuildStatus> {
    match (build, pod) {
        (BuildStatus::Pending, PodCondition::Running) => Some(BuildStatus::Running),
        (BuildStatus::Running, PodCondition::Succeeded) => Some(BuildStatus::Complete),
        (BuildStatus::Running, PodCondition::Failed) => Some(BuildStatus::Failed),
        _ => None,
    }
}
