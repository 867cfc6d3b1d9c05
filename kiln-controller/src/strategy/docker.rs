//! Docker build strategy
//!
//! Runs a builder image that performs a plain `docker build` of the source,
//! talking to the host daemon through its socket.

use kiln_core::domain::build::{Build, BuildStrategy};
use kiln_core::domain::pod::{Container, EnvVar, Pod};
use std::path::{Component, Path};

use super::{BuildPodStrategy, base_env, base_pod, docker_socket_mount, validate_common};
use crate::error::StrategyError;

pub struct DockerBuildStrategy {
    image: String,
    docker_socket: String,
}

impl DockerBuildStrategy {
    /// # Arguments
    /// * `image` - Builder image that runs the docker build
    /// * `docker_socket` - Host path of the docker daemon socket
    pub fn new(image: impl Into<String>, docker_socket: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            docker_socket: docker_socket.into(),
        }
    }
}

impl BuildPodStrategy for DockerBuildStrategy {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let BuildStrategy::Docker {
            context_dir,
            no_cache,
        } = &build.parameters.strategy
        else {
            return Err(StrategyError::StrategyMismatch {
                strategy: "docker",
                requested: build.parameters.strategy.kind(),
            });
        };

        validate_common(build)?;

        let mut env = base_env(build);
        if let Some(dir) = context_dir.as_deref().filter(|dir| !dir.is_empty()) {
            validate_context_dir(dir)?;
            env.push(EnvVar::new("CONTEXT_DIR", dir));
        }
        env.push(EnvVar::new("NO_CACHE", no_cache.to_string()));

        let mut pod = base_pod(build, &self.docker_socket);
        pod.spec.containers.push(Container {
            name: "docker-build".to_string(),
            image: self.image.clone(),
            env,
            privileged: true,
            volume_mounts: vec![docker_socket_mount(&self.docker_socket)],
        });

        Ok(pod)
    }
}

/// Context dir must stay inside the checked-out source
fn validate_context_dir(dir: &str) -> Result<(), StrategyError> {
    let escapes = Path::new(dir)
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::ParentDir | Component::Prefix(_)));

    if escapes {
        return Err(StrategyError::InvalidContextDir(dir.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::{docker_build, source_build};

    fn strategy() -> DockerBuildStrategy {
        DockerBuildStrategy::new("kiln/docker-builder", "/var/run/docker.sock")
    }

    #[test]
    fn test_docker_pod_shape() {
        let pod = strategy().create_build_pod(&docker_build("dataBuild")).unwrap();

        assert_eq!(pod.spec.containers.len(), 1);
        let container = &pod.spec.containers[0];
        assert_eq!(container.name, "docker-build");
        assert!(container.privileged);
        assert_eq!(container.env_value("CONTEXT_DIR"), Some("contextimage"));
        assert_eq!(container.env_value("NO_CACHE"), Some("false"));
        assert_eq!(container.env_value("BUILD_TAG"), Some("repository/dataBuild"));
        assert_eq!(
            container.env_value("SOURCE_URI"),
            Some("http://my.build.com/the/build/Dockerfile")
        );
        assert_eq!(container.volume_mounts[0].mount_path, "/var/run/docker.sock");
        assert_eq!(pod.spec.volumes[0].host_path, "/var/run/docker.sock");
    }

    #[test]
    fn test_docker_rejects_escaping_context_dir() {
        let mut build = docker_build("dataBuild");
        build.parameters.strategy = BuildStrategy::Docker {
            context_dir: Some("../outside".to_string()),
            no_cache: true,
        };
        assert_eq!(
            strategy().create_build_pod(&build),
            Err(StrategyError::InvalidContextDir("../outside".to_string()))
        );

        build.parameters.strategy = BuildStrategy::Docker {
            context_dir: Some("/etc".to_string()),
            no_cache: true,
        };
        assert!(strategy().create_build_pod(&build).is_err());
    }

    #[test]
    fn test_docker_without_context_dir() {
        let mut build = docker_build("dataBuild");
        build.parameters.strategy = BuildStrategy::Docker {
            context_dir: None,
            no_cache: true,
        };

        let pod = strategy().create_build_pod(&build).unwrap();
        let container = &pod.spec.containers[0];
        assert_eq!(container.env_value("CONTEXT_DIR"), None);
        assert_eq!(container.env_value("NO_CACHE"), Some("true"));
    }

    #[test]
    fn test_docker_rejects_source_build() {
        assert_eq!(
            strategy().create_build_pod(&source_build("ruby-app")),
            Err(StrategyError::StrategyMismatch {
                strategy: "docker",
                requested: "sti",
            })
        );
    }
}
