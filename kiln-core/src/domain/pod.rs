//! Pod domain types
//!
//! A Pod is the unit of execution on the cluster. The controller builds pod
//! specifications through a strategy and observes pod state, but never
//! mutates a pod once submitted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pod record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: PodSpec,
    #[serde(default)]
    pub current_state: PodState,
}

impl Pod {
    /// Exit codes of every terminated container
    pub fn exit_codes(&self) -> Vec<i32> {
        let mut codes: Vec<i32> = self
            .current_state
            .info
            .values()
            .filter_map(|status| match status.state {
                ContainerState::Terminated { exit_code } => Some(exit_code),
                _ => None,
            })
            .collect();
        codes.sort_unstable();
        codes
    }
}

/// Desired pod shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Container {
    /// Looks up an environment variable by name
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|var| var.name == name)
            .map(|var| var.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Host path made available to containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub host_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
}

/// Observed pod state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodState {
    pub status: PodCondition,
    /// Per-container status keyed by container name
    #[serde(default)]
    pub info: HashMap<String, ContainerStatus>,
}

/// Coarse pod status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodCondition {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for PodCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodCondition::Pending => write!(f, "Pending"),
            PodCondition::Running => write!(f, "Running"),
            PodCondition::Succeeded => write!(f, "Succeeded"),
            PodCondition::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Waiting,
    Running,
    Terminated { exit_code: i32 },
}
