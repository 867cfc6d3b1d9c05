//! Controller configuration
//!
//! Defines all configurable parameters for the controller including
//! builder images, dispatch behaviour and the pod watch interval.

use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::{DispatchConfig, DispatchMode, RetryPolicy};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace for builds submitted without one
    pub namespace: String,

    /// Address the HTTP API listens on (e.g., "0.0.0.0:8080")
    pub bind_addr: String,

    /// Image that runs Docker strategy builds
    pub docker_builder_image: String,

    /// Image that runs Source-to-Image builds
    pub sti_builder_image: String,

    /// Host docker socket mounted into build containers
    pub docker_socket: String,

    /// Podman executable used for pods
    pub podman_binary: String,

    pub dispatch_mode: DispatchMode,

    /// Max builds and pods handled at once
    pub max_in_flight: usize,

    /// Pause after an empty pull from the event sources
    pub idle_interval: Duration,

    /// How often podman is polled for pod state
    pub watch_interval: Duration,

    /// Extra attempts at persisting a build after a failed write
    pub persist_retries: u32,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - KILN_NAMESPACE (default: default)
    /// - KILN_BIND_ADDR (default: 0.0.0.0:8080)
    /// - KILN_DOCKER_BUILDER_IMAGE
    /// - KILN_STI_BUILDER_IMAGE
    /// - KILN_DOCKER_SOCKET (default: /var/run/docker.sock)
    /// - KILN_PODMAN (default: podman)
    /// - KILN_DISPATCH_MODE (sequential | concurrent, default: concurrent)
    /// - KILN_MAX_IN_FLIGHT (default: 4)
    /// - KILN_IDLE_INTERVAL_MS (milliseconds, default: 200)
    /// - KILN_WATCH_INTERVAL (seconds, default: 2)
    /// - KILN_PERSIST_RETRIES (default: 5)
    ///
    /// # Errors
    /// Fails when a set variable cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        let dispatch_mode = parse_var::<DispatchMode>(&lookup, "KILN_DISPATCH_MODE")?
            .unwrap_or(defaults.dispatch_mode);
        let max_in_flight = parse_var::<usize>(&lookup, "KILN_MAX_IN_FLIGHT")?
            .unwrap_or(defaults.max_in_flight);
        let idle_interval = parse_var::<u64>(&lookup, "KILN_IDLE_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_interval);
        let watch_interval = parse_var::<u64>(&lookup, "KILN_WATCH_INTERVAL")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.watch_interval);
        let persist_retries = parse_var::<u32>(&lookup, "KILN_PERSIST_RETRIES")?
            .unwrap_or(defaults.persist_retries);

        Ok(Self {
            namespace: string("KILN_NAMESPACE", defaults.namespace),
            bind_addr: string("KILN_BIND_ADDR", defaults.bind_addr),
            docker_builder_image: string("KILN_DOCKER_BUILDER_IMAGE", defaults.docker_builder_image),
            sti_builder_image: string("KILN_STI_BUILDER_IMAGE", defaults.sti_builder_image),
            docker_socket: string("KILN_DOCKER_SOCKET", defaults.docker_socket),
            podman_binary: string("KILN_PODMAN", defaults.podman_binary),
            dispatch_mode,
            max_in_flight,
            idle_interval,
            watch_interval,
            persist_retries,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.namespace.trim().is_empty() {
            anyhow::bail!("namespace cannot be empty");
        }

        if self.bind_addr.trim().is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.docker_builder_image.trim().is_empty() {
            anyhow::bail!("docker_builder_image cannot be empty");
        }

        if self.sti_builder_image.trim().is_empty() {
            anyhow::bail!("sti_builder_image cannot be empty");
        }

        if self.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be greater than 0");
        }

        if self.idle_interval.is_zero() {
            anyhow::bail!("idle_interval must be greater than 0");
        }

        if self.watch_interval.is_zero() {
            anyhow::bail!("watch_interval must be greater than 0");
        }

        Ok(())
    }

    /// Dispatch loop settings derived from this configuration
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            mode: self.dispatch_mode,
            max_in_flight: self.max_in_flight,
            idle_interval: self.idle_interval,
            retry: RetryPolicy {
                retries: self.persist_retries,
                ..RetryPolicy::default()
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            docker_builder_image: "openshift/docker-builder".to_string(),
            sti_builder_image: "openshift/sti-builder".to_string(),
            docker_socket: "/var/run/docker.sock".to_string(),
            podman_binary: "podman".to_string(),
            dispatch_mode: DispatchMode::Concurrent,
            max_in_flight: 4,
            idle_interval: Duration::from_millis(200),
            watch_interval: Duration::from_secs(2),
            persist_retries: 5,
        }
    }
}

/// Parses `key` when it is set
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e))
        })
        .transpose()
}
