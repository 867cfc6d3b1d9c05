//! Build DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::build::{Build, BuildParameters, BuildStatus};

/// Request to create a new build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuild {
    pub name: String,
    /// Defaults to the controller's namespace when absent
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub parameters: BuildParameters,
}

impl CreateBuild {
    /// Turns the request into a `New` build
    pub fn into_build(self, default_namespace: &str) -> Build {
        let namespace = self
            .namespace
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| default_namespace.to_string());

        let mut build = Build::new(self.name, namespace, self.parameters);
        build.labels = self.labels;
        build
    }
}

/// Build summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub name: String,
    pub namespace: String,
    pub status: BuildStatus,
    pub strategy: String,
    pub pod_name: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Build> for BuildSummary {
    fn from(build: Build) -> Self {
        Self {
            strategy: build.parameters.strategy.kind().to_string(),
            name: build.name,
            namespace: build.namespace,
            status: build.status,
            pod_name: build.pod_name,
            message: build.message,
            created_at: build.created_at,
            completed_at: build.completed_at,
        }
    }
}
