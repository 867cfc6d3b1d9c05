//! Error types for the build controller
//!
//! Every failure the controller sees while handling a build or a pod ends up
//! here. None of them escape a handler: they are folded into the returned
//! build status and carried alongside it for logging.

use thiserror::Error;

/// A build's parameters could not be translated into a pod
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("build name must not be empty")]
    EmptyName,

    #[error("git source URI must not be empty")]
    EmptySourceUri,

    #[error("unsupported git source URI: {0}")]
    UnsupportedSourceUri(String),

    #[error("output image tag must not be empty")]
    EmptyImageTag,

    #[error("context dir must be a relative path inside the source: {0}")]
    InvalidContextDir(String),

    #[error("builder image must not be empty")]
    EmptyBuilderImage,

    #[error("{strategy} strategy cannot build a {requested} build")]
    StrategyMismatch {
        strategy: &'static str,
        requested: &'static str,
    },
}

/// Pod submission failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreatePodError {
    #[error("pod {0} already exists")]
    AlreadyExists(String),

    #[error("failed to create pod: {0}")]
    Failed(String),
}

impl CreatePodError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Build store failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("build {0} not found")]
    NotFound(String),

    #[error("build {0} already exists")]
    AlreadyExists(String),

    /// The update was made from a stale copy, or would move the build backwards
    #[error("conflicting update for build {name}: stored {stored}, update {update}")]
    Conflict {
        name: String,
        stored: String,
        update: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Anything the controller reports back to the dispatch loop
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("invalid build definition: {0}")]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    CreatePod(#[from] CreatePodError),

    #[error("build store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_is_distinguishable() {
        assert!(CreatePodError::AlreadyExists("p1".to_string()).is_already_exists());
        assert!(!CreatePodError::Failed("boom".to_string()).is_already_exists());
    }

    #[test]
    fn test_controller_error_messages() {
        let err: ControllerError = StrategyError::EmptyImageTag.into();
        assert_eq!(
            err.to_string(),
            "invalid build definition: output image tag must not be empty"
        );

        let err: ControllerError = CreatePodError::AlreadyExists("p1".to_string()).into();
        assert_eq!(err.to_string(), "pod p1 already exists");

        let err: ControllerError = StoreError::Unavailable("lookup down".to_string()).into();
        assert_eq!(err.to_string(), "build store error: store unavailable: lookup down");
    }
}
