//! Source-to-Image build strategy
//!
//! Runs the STI builder, which layers the application source onto a
//! language builder image and commits the result as the output image.

use kiln_core::domain::build::{Build, BuildStrategy};
use kiln_core::domain::pod::{Container, EnvVar, Pod};

use super::{BuildPodStrategy, base_env, base_pod, docker_socket_mount, validate_common};
use crate::error::StrategyError;

pub struct SourceBuildStrategy {
    image: String,
    docker_socket: String,
}

impl SourceBuildStrategy {
    /// # Arguments
    /// * `image` - Image that runs the STI builder
    /// * `docker_socket` - Host path of the docker daemon socket
    pub fn new(image: impl Into<String>, docker_socket: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            docker_socket: docker_socket.into(),
        }
    }
}

impl BuildPodStrategy for SourceBuildStrategy {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let BuildStrategy::Source {
            builder_image,
            scripts,
            clean,
        } = &build.parameters.strategy
        else {
            return Err(StrategyError::StrategyMismatch {
                strategy: "sti",
                requested: build.parameters.strategy.kind(),
            });
        };

        validate_common(build)?;

        if builder_image.trim().is_empty() {
            return Err(StrategyError::EmptyBuilderImage);
        }

        let mut env = base_env(build);
        env.push(EnvVar::new("BUILDER_IMAGE", builder_image.trim()));
        if let Some(scripts) = scripts.as_deref().filter(|s| !s.is_empty()) {
            env.push(EnvVar::new("SCRIPTS", scripts));
        }
        env.push(EnvVar::new("CLEAN", clean.to_string()));

        let mut pod = base_pod(build, &self.docker_socket);
        pod.spec.containers.push(Container {
            name: "sti-build".to_string(),
            image: self.image.clone(),
            env,
            privileged: true,
            volume_mounts: vec![docker_socket_mount(&self.docker_socket)],
        });

        Ok(pod)
    }
}
