//! Podman cluster adapter
//!
//! Backs the controller's cluster collaborators with the local podman CLI:
//! - Creating a podman pod per build pod, one container per pod container
//! - Watching the pods of in-flight builds and feeding their state back
//!
//! Podman has no namespaces, so pods are named `<namespace>.<pod name>` and
//! containers `<podman pod>-<container name>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_core::domain::build::BuildStatus;
use kiln_core::domain::pod::{
    ContainerState, ContainerStatus, Pod, PodCondition, RestartPolicy,
};
use serde::Deserialize;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CreatePodError;
use crate::repository::{MemoryBuildStore, MemoryPodQueue, PodCreator};

const NAMESPACE_LABEL: &str = "kiln.namespace";

/// Checks if podman is installed and available
pub async fn check_podman_available(binary: &str) -> Result<()> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("Failed to execute '{} --version'. Is podman installed?", binary))?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Name of the podman pod backing a cluster pod
pub fn podman_pod_name(namespace: &str, pod_name: &str) -> String {
    format!("{}.{}", namespace, pod_name)
}

async fn run_podman(binary: &str, args: &[String]) -> std::io::Result<Output> {
    debug!("Running {} {}", binary, args.join(" "));
    Command::new(binary).args(args).output().await
}

/// Whether podman's error output reports a name collision
fn is_name_conflict(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("already exists") || stderr.contains("is in use")
}

/// Submits pods by creating them with podman
pub struct PodmanPodCreator {
    binary: String,
}

impl PodmanPodCreator {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Removes a partially created pod
    async fn remove_pod(&self, name: &str) {
        let args = vec![
            "pod".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            name.to_string(),
        ];
        match run_podman(&self.binary, &args).await {
            Ok(output) if output.status.success() => debug!("Pod {} removed", name),
            Ok(output) => warn!(
                "Failed to remove pod {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to remove pod {}: {}", name, e),
        }
    }
}

#[async_trait]
impl PodCreator for PodmanPodCreator {
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, CreatePodError> {
        let name = podman_pod_name(namespace, &pod.name);
        info!("Creating podman pod {}", name);

        let output = run_podman(&self.binary, &pod_create_args(&name, namespace, &pod))
            .await
            .map_err(|e| CreatePodError::Failed(format!("failed to execute podman: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_name_conflict(&stderr) {
                return Err(CreatePodError::AlreadyExists(pod.name));
            }
            return Err(CreatePodError::Failed(format!(
                "podman pod create exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        for container in &pod.spec.containers {
            let args = match container_run_args(&name, &pod, container) {
                Ok(args) => args,
                Err(e) => {
                    self.remove_pod(&name).await;
                    return Err(e);
                }
            };

            let output = match run_podman(&self.binary, &args).await {
                Ok(output) => output,
                Err(e) => {
                    self.remove_pod(&name).await;
                    return Err(CreatePodError::Failed(format!(
                        "failed to execute podman: {}",
                        e
                    )));
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                error!(
                    "Failed to start container {} in pod {}: {}",
                    container.name, name, stderr
                );
                self.remove_pod(&name).await;
                return Err(CreatePodError::Failed(format!(
                    "container {} failed to start: {}",
                    container.name, stderr
                )));
            }
        }

        info!(
            "Pod {} started with {} container(s)",
            name,
            pod.spec.containers.len()
        );
        Ok(pod)
    }
}

fn pod_create_args(name: &str, namespace: &str, pod: &Pod) -> Vec<String> {
    let mut args = vec![
        "pod".to_string(),
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        format!("{}={}", NAMESPACE_LABEL, namespace),
    ];

    let mut labels: Vec<(&String, &String)> = pod.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args
}

fn container_run_args(
    pod_name: &str,
    pod: &Pod,
    container: &kiln_core::domain::pod::Container,
) -> Result<Vec<String>, CreatePodError> {
    let restart = match pod.spec.restart_policy {
        RestartPolicy::Always => "always",
        RestartPolicy::OnFailure => "on-failure",
        RestartPolicy::Never => "no",
    };

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--pod".to_string(),
        pod_name.to_string(),
        "--name".to_string(),
        format!("{}-{}", pod_name, container.name),
        format!("--restart={}", restart),
    ];

    if container.privileged {
        args.push("--privileged".to_string());
    }

    for var in &container.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", var.name, var.value));
    }

    for mount in &container.volume_mounts {
        let volume = pod
            .spec
            .volumes
            .iter()
            .find(|v| v.name == mount.name)
            .ok_or_else(|| {
                CreatePodError::Failed(format!(
                    "container {} mounts unknown volume {}",
                    container.name, mount.name
                ))
            })?;
        args.push("-v".to_string());
        args.push(format!("{}:{}", volume.host_path, mount.mount_path));
    }

    args.push(container.image.clone());
    Ok(args)
}

/// One entry of `podman ps --format json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    is_infra: bool,
}

/// Builds the observed pod from podman's container listing
///
/// Returns `None` when the pod has no build containers.
fn observe_pod(namespace: &str, pod_name: &str, entries: &[PsEntry]) -> Option<Pod> {
    let prefix = format!("{}-", podman_pod_name(namespace, pod_name));

    let mut pod = Pod {
        name: pod_name.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    };

    for entry in entries.iter().filter(|e| !e.is_infra) {
        let Some(full_name) = entry.names.first() else {
            continue;
        };
        let container = full_name
            .strip_prefix(&prefix)
            .unwrap_or(full_name)
            .to_string();

        let state = match entry.state.to_ascii_lowercase().as_str() {
            "running" | "paused" => ContainerState::Running,
            "exited" | "stopped" => ContainerState::Terminated {
                exit_code: entry.exit_code,
            },
            _ => ContainerState::Waiting,
        };
        pod.current_state
            .info
            .insert(container, ContainerStatus { state });
    }

    if pod.current_state.info.is_empty() {
        return None;
    }

    pod.current_state.status = pod_condition(&pod);
    Some(pod)
}

/// Coarse pod status from its containers
fn pod_condition(pod: &Pod) -> PodCondition {
    let states: Vec<ContainerState> = pod
        .current_state
        .info
        .values()
        .map(|status| status.state)
        .collect();

    let failed = states
        .iter()
        .any(|s| matches!(s, ContainerState::Terminated { exit_code } if *exit_code != 0));
    if failed {
        return PodCondition::Failed;
    }

    if states
        .iter()
        .all(|s| matches!(s, ContainerState::Terminated { .. }))
    {
        return PodCondition::Succeeded;
    }

    if states.iter().any(|s| matches!(s, ContainerState::Running)) {
        return PodCondition::Running;
    }

    PodCondition::Pending
}

/// Pod state to report for a build currently in `status`
///
/// A build only leaves `Pending` through `Running`, so a pod that finished
/// between polls is reported running; the next poll delivers its terminal
/// state to the now `Running` build.
fn observation_for(status: BuildStatus, mut pod: Pod) -> Pod {
    if status == BuildStatus::Pending
        && matches!(
            pod.current_state.status,
            PodCondition::Succeeded | PodCondition::Failed
        )
    {
        pod.current_state.status = PodCondition::Running;
    }
    pod
}

/// Polls podman for the pods of in-flight builds
pub struct PodmanPodWatcher {
    binary: String,
    store: Arc<MemoryBuildStore>,
    queue: Arc<MemoryPodQueue>,
    interval: Duration,
}

impl PodmanPodWatcher {
    pub fn new(
        binary: impl Into<String>,
        store: Arc<MemoryBuildStore>,
        queue: Arc<MemoryPodQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            store,
            queue,
            interval,
        }
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting pod watcher (interval: {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let observed = self.poll_once().await;
            if observed > 0 {
                debug!("Observed {} pod(s) this cycle", observed);
            }
        }

        info!("Pod watcher stopped");
    }

    /// Inspects every pod of a `Pending` or `Running` build once
    pub async fn poll_once(&self) -> usize {
        let mut observed = 0;

        for build in self.store.list().await {
            if !matches!(build.status, BuildStatus::Pending | BuildStatus::Running) {
                continue;
            }
            let Some(pod_name) = build.pod_name.as_deref() else {
                continue;
            };

            match self.inspect(&build.namespace, pod_name).await {
                Ok(Some(pod)) => {
                    self.queue.push(observation_for(build.status, pod));
                    observed += 1;
                }
                Ok(None) => debug!("Pod {} not found yet", pod_name),
                Err(e) => warn!("Failed to inspect pod {}: {:#}", pod_name, e),
            }
        }

        observed
    }

    async fn inspect(&self, namespace: &str, pod_name: &str) -> Result<Option<Pod>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("pod={}", podman_pod_name(namespace, pod_name)),
            "--format".to_string(),
            "json".to_string(),
        ];

        let output = run_podman(&self.binary, &args)
            .await
            .context("Failed to execute podman ps")?;

        if !output.status.success() {
            anyhow::bail!(
                "podman ps exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let entries: Vec<PsEntry> = if output.stdout.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            serde_json::from_slice(&output.stdout).context("Failed to parse podman ps output")?
        };

        Ok(observe_pod(namespace, pod_name, &entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::docker_build;
    use crate::strategy::{BuildPodStrategy, DockerBuildStrategy};

    fn entries(json: &str) -> Vec<PsEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_name_conflict_detection() {
        assert!(is_name_conflict(
            "Error: adding pod to state: name \"default.p1\" is in use: pod already exists"
        ));
        assert!(!is_name_conflict("Error: short-name resolution failed"));
    }

    #[test]
    fn test_container_run_args() {
        let strategy = DockerBuildStrategy::new("kiln/docker-builder", "/var/run/docker.sock");
        let pod = strategy.create_build_pod(&docker_build("dataBuild")).unwrap();
        let name = podman_pod_name("default", &pod.name);

        let args = container_run_args(&name, &pod, &pod.spec.containers[0]).unwrap();

        assert_eq!(&args[..4], &["run", "-d", "--pod", "default.build-docker-dataBuild"]);
        assert!(args.contains(&"default.build-docker-dataBuild-docker-build".to_string()));
        assert!(args.contains(&"--restart=no".to_string()));
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"BUILD_TAG=repository/dataBuild".to_string()));
        assert!(args.contains(&"/var/run/docker.sock:/var/run/docker.sock".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("kiln/docker-builder"));
    }

    #[test]
    fn test_container_run_args_unknown_volume() {
        let strategy = DockerBuildStrategy::new("kiln/docker-builder", "/var/run/docker.sock");
        let mut pod = strategy.create_build_pod(&docker_build("dataBuild")).unwrap();
        pod.spec.volumes.clear();

        let result = container_run_args("default.p", &pod, &pod.spec.containers[0]);
        assert!(matches!(result, Err(CreatePodError::Failed(_))));
    }

    #[test]
    fn test_pod_create_args_carry_labels() {
        let strategy = DockerBuildStrategy::new("kiln/docker-builder", "/var/run/docker.sock");
        let pod = strategy.create_build_pod(&docker_build("dataBuild")).unwrap();

        let args = pod_create_args("default.p", "default", &pod);
        assert_eq!(&args[..4], &["pod", "create", "--name", "default.p"]);
        assert!(args.contains(&"kiln.namespace=default".to_string()));
        assert!(args.contains(&"build=dataBuild".to_string()));
    }

    #[test]
    fn test_observe_running_pod() {
        let list = entries(
            r#"[
                {"Names": ["default.p1-infra"], "State": "running", "IsInfra": true},
                {"Names": ["default.p1-docker-build"], "State": "running", "ExitCode": 0}
            ]"#,
        );

        let pod = observe_pod("default", "p1", &list).unwrap();
        assert_eq!(pod.current_state.status, PodCondition::Running);
        assert_eq!(pod.current_state.info.len(), 1);
        assert!(pod.current_state.info.contains_key("docker-build"));
    }

    #[test]
    fn test_observe_finished_pods() {
        let ok = entries(r#"[{"Names": ["default.p1-docker-build"], "State": "exited", "ExitCode": 0}]"#);
        assert_eq!(
            observe_pod("default", "p1", &ok).unwrap().current_state.status,
            PodCondition::Succeeded
        );

        let failed = entries(r#"[{"Names": ["default.p1-docker-build"], "State": "exited", "ExitCode": 2}]"#);
        let pod = observe_pod("default", "p1", &failed).unwrap();
        assert_eq!(pod.current_state.status, PodCondition::Failed);
        assert_eq!(pod.exit_codes(), vec![2]);
    }

    #[test]
    fn test_observe_created_pod_is_pending() {
        let list = entries(r#"[{"Names": ["default.p1-docker-build"], "State": "created"}]"#);
        assert_eq!(
            observe_pod("default", "p1", &list).unwrap().current_state.status,
            PodCondition::Pending
        );
    }

    fn finished_pod(exit_code: i32) -> Pod {
        let list = entries(&format!(
            r#"[{{"Names": ["default.p1-docker-build"], "State": "exited", "ExitCode": {}}}]"#,
            exit_code
        ));
        observe_pod("default", "p1", &list).unwrap()
    }

    #[test]
    fn test_finished_pod_reported_running_to_pending_build() {
        for exit_code in [0, 1] {
            let pod = observation_for(BuildStatus::Pending, finished_pod(exit_code));
            assert_eq!(pod.current_state.status, PodCondition::Running);
        }
    }

    #[test]
    fn test_finished_pod_reported_as_is_to_running_build() {
        let pod = observation_for(BuildStatus::Running, finished_pod(0));
        assert_eq!(pod.current_state.status, PodCondition::Succeeded);

        let pod = observation_for(BuildStatus::Running, finished_pod(3));
        assert_eq!(pod.current_state.status, PodCondition::Failed);
        assert_eq!(pod.exit_codes(), vec![3]);
    }

    #[test]
    fn test_pending_pod_reported_as_is() {
        let list = entries(r#"[{"Names": ["default.p1-docker-build"], "State": "created"}]"#);
        let pod = observe_pod("default", "p1", &list).unwrap();
        let reported = observation_for(BuildStatus::Pending, pod.clone());
        assert_eq!(reported, pod);
    }

    #[test]
    fn test_observe_missing_pod() {
        let list = entries(r#"[{"Names": ["default.p1-infra"], "State": "running", "IsInfra": true}]"#);
        assert!(observe_pod("default", "p1", &list).is_none());
        assert!(observe_pod("default", "p1", &[]).is_none());
    }
}
