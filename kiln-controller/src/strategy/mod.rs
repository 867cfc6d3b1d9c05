//! Build strategies
//!
//! A strategy turns a build into the pod that executes it. Strategies are
//! pure: the same build always yields the same pod, and nothing is submitted
//! to the cluster here.
//!
//! The controller only sees [`BuildPodStrategy`]. [`StrategySelector`] picks
//! the concrete strategy from the build's declared strategy type.

mod docker;
mod source;

pub use docker::DockerBuildStrategy;
pub use source::SourceBuildStrategy;

use kiln_core::domain::build::{Build, BuildSource};
use kiln_core::domain::pod::{EnvVar, Pod, Volume, VolumeMount};
use std::collections::HashMap;

use crate::error::StrategyError;

/// Label that ties a pod back to its build
pub const BUILD_LABEL: &str = "build";

const DOCKER_SOCKET_VOLUME: &str = "docker-socket";

const GIT_URI_PREFIXES: &[&str] = &["http://", "https://", "git://", "ssh://", "git@", "file://"];

/// Translates a build into a pod specification
pub trait BuildPodStrategy: Send + Sync {
    /// Creates the pod for a build
    ///
    /// # Errors
    /// Returns a [`StrategyError`] when the build's parameters cannot be
    /// turned into a pod.
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError>;
}

/// Dispatches to the strategy matching the build's declared type
pub struct StrategySelector {
    docker: DockerBuildStrategy,
    source: SourceBuildStrategy,
}

impl StrategySelector {
    pub fn new(docker: DockerBuildStrategy, source: SourceBuildStrategy) -> Self {
        Self { docker, source }
    }
}

impl BuildPodStrategy for StrategySelector {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        use kiln_core::domain::build::BuildStrategy;

        match build.parameters.strategy {
            BuildStrategy::Docker { .. } => self.docker.create_build_pod(build),
            BuildStrategy::Source { .. } => self.source.create_build_pod(build),
        }
    }
}

/// Deterministic pod name for a build
///
/// Redelivering the same build produces the same name, so a second
/// submission collides instead of starting a second pod.
pub fn pod_name_for(build: &Build) -> String {
    format!(
        "build-{}-{}",
        build.parameters.strategy.kind(),
        build.name
    )
}

/// Checks shared by every strategy
fn validate_common(build: &Build) -> Result<(), StrategyError> {
    if build.name.trim().is_empty() {
        return Err(StrategyError::EmptyName);
    }

    match &build.parameters.source {
        BuildSource::Git { uri, .. } => {
            let uri = uri.trim();
            if uri.is_empty() {
                return Err(StrategyError::EmptySourceUri);
            }
            if !GIT_URI_PREFIXES.iter().any(|prefix| uri.starts_with(prefix)) {
                return Err(StrategyError::UnsupportedSourceUri(uri.to_string()));
            }
        }
    }

    if build.parameters.output.image_tag.trim().is_empty() {
        return Err(StrategyError::EmptyImageTag);
    }

    Ok(())
}

/// Environment every build container receives
fn base_env(build: &Build) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar::new("BUILD_NAME", &build.name),
        EnvVar::new("BUILD_TAG", &build.parameters.output.image_tag),
    ];

    if let Some(registry) = &build.parameters.output.registry {
        env.push(EnvVar::new("REGISTRY", registry));
    }

    match &build.parameters.source {
        BuildSource::Git { uri, git_ref } => {
            env.push(EnvVar::new("SOURCE_URI", uri.trim()));
            if let Some(git_ref) = git_ref {
                env.push(EnvVar::new("SOURCE_REF", git_ref));
            }
        }
    }

    env
}

/// Pod skeleton shared by every strategy; the caller adds the container
fn base_pod(build: &Build, docker_socket: &str) -> Pod {
    let mut labels: HashMap<String, String> = build.labels.clone();
    labels.insert(BUILD_LABEL.to_string(), build.name.clone());

    let mut pod = Pod {
        name: pod_name_for(build),
        namespace: build.namespace.clone(),
        labels,
        ..Default::default()
    };
    pod.spec.volumes.push(Volume {
        name: DOCKER_SOCKET_VOLUME.to_string(),
        host_path: docker_socket.to_string(),
    });
    pod
}

fn docker_socket_mount(docker_socket: &str) -> VolumeMount {
    VolumeMount {
        name: DOCKER_SOCKET_VOLUME.to_string(),
        mount_path: docker_socket.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kiln_core::domain::build::{BuildOutput, BuildParameters, BuildStrategy};

    pub(crate) fn docker_build(name: &str) -> Build {
        Build::new(
            name,
            "default",
            BuildParameters {
                source: BuildSource::Git {
                    uri: "http://my.build.com/the/build/Dockerfile".to_string(),
                    git_ref: None,
                },
                strategy: BuildStrategy::Docker {
                    context_dir: Some("contextimage".to_string()),
                    no_cache: false,
                },
                output: BuildOutput {
                    image_tag: "repository/dataBuild".to_string(),
                    registry: None,
                },
            },
        )
    }

    pub(crate) fn source_build(name: &str) -> Build {
        Build::new(
            name,
            "default",
            BuildParameters {
                source: BuildSource::Git {
                    uri: "https://github.com/example/ruby-app.git".to_string(),
                    git_ref: Some("main".to_string()),
                },
                strategy: BuildStrategy::Source {
                    builder_image: "openshift/ruby-20-centos".to_string(),
                    scripts: None,
                    clean: true,
                },
                output: BuildOutput {
                    image_tag: "example/ruby-app".to_string(),
                    registry: Some("registry.local:5000".to_string()),
                },
            },
        )
    }

    fn selector() -> StrategySelector {
        StrategySelector::new(
            DockerBuildStrategy::new("kiln/docker-builder", "/var/run/docker.sock"),
            SourceBuildStrategy::new("kiln/sti-builder", "/var/run/docker.sock"),
        )
    }

    #[test]
    fn test_selector_dispatches_on_strategy_type() {
        let strategies = selector();

        let pod = strategies.create_build_pod(&docker_build("dataBuild")).unwrap();
        assert_eq!(pod.name, "build-docker-dataBuild");
        assert_eq!(pod.spec.containers[0].image, "kiln/docker-builder");

        let pod = strategies.create_build_pod(&source_build("ruby-app")).unwrap();
        assert_eq!(pod.name, "build-sti-ruby-app");
        assert_eq!(pod.spec.containers[0].image, "kiln/sti-builder");
    }

    #[test]
    fn test_pod_is_deterministic() {
        let strategies = selector();
        let build = docker_build("dataBuild");

        let first = strategies.create_build_pod(&build).unwrap();
        let second = strategies.create_build_pod(&build).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pod_carries_build_label_and_namespace() {
        let mut build = docker_build("dataBuild");
        build.namespace = "team-a".to_string();
        build
            .labels
            .insert("name".to_string(), "dataBuild".to_string());

        let pod = selector().create_build_pod(&build).unwrap();
        assert_eq!(pod.namespace, "team-a");
        assert_eq!(pod.labels.get(BUILD_LABEL), Some(&"dataBuild".to_string()));
        assert_eq!(pod.labels.get("name"), Some(&"dataBuild".to_string()));
    }

    #[test]
    fn test_validate_common_rejects_bad_source() {
        let mut build = docker_build("dataBuild");
        build.parameters.source = BuildSource::Git {
            uri: "   ".to_string(),
            git_ref: None,
        };
        assert_eq!(validate_common(&build), Err(StrategyError::EmptySourceUri));

        build.parameters.source = BuildSource::Git {
            uri: "ftp://example.com/repo".to_string(),
            git_ref: None,
        };
        assert!(matches!(
            validate_common(&build),
            Err(StrategyError::UnsupportedSourceUri(_))
        ));

        build.parameters.source = BuildSource::Git {
            uri: "git@github.com:example/app.git".to_string(),
            git_ref: None,
        };
        assert!(validate_common(&build).is_ok());
    }

    #[test]
    fn test_validate_common_rejects_empty_tag_and_name() {
        let mut build = docker_build("dataBuild");
        build.parameters.output.image_tag = String::new();
        assert_eq!(validate_common(&build), Err(StrategyError::EmptyImageTag));

        let mut build = docker_build(" ");
        build.parameters.output.image_tag = "tag".to_string();
        assert_eq!(validate_common(&build), Err(StrategyError::EmptyName));
    }

    #[test]
    fn test_base_env_includes_optional_fields() {
        let env = base_env(&source_build("ruby-app"));
        let names: Vec<&str> = env.iter().map(|var| var.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["BUILD_NAME", "BUILD_TAG", "REGISTRY", "SOURCE_URI", "SOURCE_REF"]
        );

        let env = base_env(&docker_build("dataBuild"));
        assert!(!env.iter().any(|var| var.name == "REGISTRY"));
        assert!(!env.iter().any(|var| var.name == "SOURCE_REF"));
    }
}
