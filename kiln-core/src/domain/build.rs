//! Build domain types
//!
//! A Build is the declarative record of a requested image build. Its
//! parameters are immutable once created; only the controller moves its
//! status forward and records the pod that materializes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Build record
///
/// Structure shared between the store (persists) and the controller (mutates status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub name: String,
    pub namespace: String,
    pub uid: Uuid,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub status: BuildStatus,
    /// Pod materialized for this build, once created
    pub pod_name: Option<String>,
    pub parameters: BuildParameters,
    /// Reason for the last failure transition
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Store revision this copy was read at; every stored write bumps it
    #[serde(default)]
    pub resource_version: u64,
}

impl Build {
    /// Creates a new build in the `New` status
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        parameters: BuildParameters,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uuid::new_v4(),
            labels: HashMap::new(),
            status: BuildStatus::New,
            pod_name: None,
            parameters,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            resource_version: 0,
        }
    }

    /// Moves the build to `next`, stamping lifecycle timestamps.
    ///
    /// Returns `false` and leaves the build untouched when the move would
    /// regress the lifecycle.
    pub fn transition_to(&mut self, next: BuildStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == self.status {
            return true;
        }

        let now = Utc::now();
        if next == BuildStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }
}

/// Build lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    /// Created, no pod yet
    New,
    /// Pod submitted, not running yet
    Pending,
    Running,
    Complete,
    Failed,
    /// Build definition error before any pod existed
    Error,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Complete | BuildStatus::Failed | BuildStatus::Error
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in place is always allowed.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (New, Pending)
                | (New, Failed)
                | (New, Error)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Complete)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::New => write!(f, "New"),
            BuildStatus::Pending => write!(f, "Pending"),
            BuildStatus::Running => write!(f, "Running"),
            BuildStatus::Complete => write!(f, "Complete"),
            BuildStatus::Failed => write!(f, "Failed"),
            BuildStatus::Error => write!(f, "Error"),
        }
    }
}

/// Immutable build specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildParameters {
    pub source: BuildSource,
    pub strategy: BuildStrategy,
    pub output: BuildOutput,
}

/// Where the build input comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildSource {
    Git {
        uri: String,
        #[serde(default, rename = "ref")]
        git_ref: Option<String>,
    },
}

/// How the image is built; the variant selects the build strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildStrategy {
    Docker {
        #[serde(default)]
        context_dir: Option<String>,
        #[serde(default)]
        no_cache: bool,
    },
    /// Source-to-Image
    Source {
        builder_image: String,
        #[serde(default)]
        scripts: Option<String>,
        #[serde(default)]
        clean: bool,
    },
}

impl BuildStrategy {
    /// Short name used in pod and container names
    pub fn kind(&self) -> &'static str {
        match self {
            BuildStrategy::Docker { .. } => "docker",
            BuildStrategy::Source { .. } => "sti",
        }
    }
}

/// Where the built image goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub image_tag: String,
    #[serde(default)]
    pub registry: Option<String>,
}
