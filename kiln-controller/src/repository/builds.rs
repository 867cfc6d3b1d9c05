//! Builds repository
//!
//! Handles access to build records:
//! - Pulling the next build event to reconcile
//! - Finding the build that owns a pod
//! - Persisting status changes

use async_trait::async_trait;
use kiln_core::domain::build::Build;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

use crate::error::StoreError;

/// Pull-based feed of build events
#[async_trait]
pub trait BuildSource: Send + Sync {
    /// Returns the next build to reconcile, or `None` when nothing is ready
    async fn next_build(&self) -> Option<Build>;
}

/// Finds the build a pod belongs to
#[async_trait]
pub trait BuildLookup: Send + Sync {
    /// # Arguments
    /// * `namespace` - Namespace of the pod
    /// * `pod_name` - Name of the pod
    async fn find_by_pod_name(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<Build>, StoreError>;
}

/// Persists build records
#[async_trait]
pub trait BuildUpdater: Send + Sync {
    /// Writes the full build record, returning what was stored
    async fn update_build(&self, build: Build) -> Result<Build, StoreError>;
}

/// In-memory build store
///
/// Builds are keyed by `namespace/name`. Creating a build queues it for the
/// build loop. An update must carry the stored `resource_version`, so a
/// write computed from a stale copy is refused; updates also never move a
/// stored build backwards.
pub struct MemoryBuildStore {
    builds: RwLock<HashMap<String, Build>>,
    queue_tx: mpsc::UnboundedSender<Build>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<Build>>,
    /// How long `next_build` waits before reporting nothing ready
    poll_timeout: Duration,
}

impl MemoryBuildStore {
    pub fn new(poll_timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            builds: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            poll_timeout,
        }
    }

    /// Stores a new build and queues it for reconciliation
    pub async fn create(&self, mut build: Build) -> Result<Build, StoreError> {
        let key = key(&build.namespace, &build.name);
        let mut builds = self.builds.write().await;

        if builds.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        build.resource_version = 1;
        builds.insert(key.clone(), build.clone());
        drop(builds);

        self.queue_tx
            .send(build.clone())
            .map_err(|_| StoreError::Unavailable("build queue closed".to_string()))?;

        debug!("Build {} created and queued", key);
        Ok(build)
    }

    /// Gets a build by namespace and name
    pub async fn get(&self, namespace: &str, name: &str) -> Option<Build> {
        self.builds.read().await.get(&key(namespace, name)).cloned()
    }

    /// Lists all builds, oldest first
    pub async fn list(&self) -> Vec<Build> {
        let mut builds: Vec<Build> = self.builds.read().await.values().cloned().collect();
        builds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        builds
    }
}

#[async_trait]
impl BuildSource for MemoryBuildStore {
    async fn next_build(&self) -> Option<Build> {
        let mut rx = self.queue_rx.lock().await;
        tokio::time::timeout(self.poll_timeout, rx.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl BuildLookup for MemoryBuildStore {
    async fn find_by_pod_name(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<Build>, StoreError> {
        let builds = self.builds.read().await;
        Ok(builds
            .values()
            .find(|b| b.namespace == namespace && b.pod_name.as_deref() == Some(pod_name))
            .cloned())
    }
}

#[async_trait]
impl BuildUpdater for MemoryBuildStore {
    async fn update_build(&self, mut build: Build) -> Result<Build, StoreError> {
        let key = key(&build.namespace, &build.name);
        let mut builds = self.builds.write().await;

        let stored = builds
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if build.resource_version != stored.resource_version {
            return Err(StoreError::Conflict {
                name: key,
                stored: format!("{} at version {}", stored.status, stored.resource_version),
                update: format!("{} at version {}", build.status, build.resource_version),
            });
        }

        if !stored.status.can_transition_to(build.status) {
            return Err(StoreError::Conflict {
                name: key,
                stored: stored.status.to_string(),
                update: build.status.to_string(),
            });
        }

        // Parameters and identity are immutable
        build.parameters = stored.parameters.clone();
        build.uid = stored.uid;
        build.created_at = stored.created_at;
        build.resource_version = stored.resource_version + 1;

        *stored = build.clone();
        debug!("Build {} stored with status {}", key, build.status);
        Ok(build)
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::docker_build;
    use kiln_core::domain::build::BuildStatus;

    fn store() -> MemoryBuildStore {
        MemoryBuildStore::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_create_queues_build() {
        let store = store();
        store.create(docker_build("dataBuild")).await.unwrap();

        let next = store.next_build().await.unwrap();
        assert_eq!(next.name, "dataBuild");
        assert!(store.next_build().await.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let store = store();
        store.create(docker_build("dataBuild")).await.unwrap();

        let result = store.create(docker_build("dataBuild")).await;
        assert_eq!(
            result,
            Err(StoreError::AlreadyExists("default/dataBuild".to_string()))
        );
    }

    #[tokio::test]
    async fn test_update_moves_forward() {
        let store = store();
        let mut build = store.create(docker_build("dataBuild")).await.unwrap();
        assert_eq!(build.resource_version, 1);

        build.transition_to(BuildStatus::Pending);
        build.pod_name = Some("build-docker-dataBuild".to_string());
        let updated = store.update_build(build).await.unwrap();
        assert_eq!(updated.resource_version, 2);

        let stored = store.get("default", "dataBuild").await.unwrap();
        assert_eq!(stored.status, BuildStatus::Pending);
        assert_eq!(stored.pod_name.as_deref(), Some("build-docker-dataBuild"));
        assert_eq!(stored.resource_version, 2);
    }

    #[tokio::test]
    async fn test_update_from_stale_copy_conflicts() {
        let store = store();
        let snapshot = store.create(docker_build("dataBuild")).await.unwrap();

        let mut pending = snapshot.clone();
        pending.transition_to(BuildStatus::Pending);
        let mut running = store.update_build(pending).await.unwrap();
        running.transition_to(BuildStatus::Running);
        store.update_build(running).await.unwrap();

        // Running -> Failed is a forward move, but this copy predates it
        let mut stale = snapshot;
        stale.transition_to(BuildStatus::Failed);
        let result = store.update_build(stale).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        let stored = store.get("default", "dataBuild").await.unwrap();
        assert_eq!(stored.status, BuildStatus::Running);
        assert_eq!(stored.resource_version, 3);
    }

    #[tokio::test]
    async fn test_update_rejects_regression() {
        let store = store();
        let build = store.create(docker_build("dataBuild")).await.unwrap();

        let mut running = build.clone();
        running.transition_to(BuildStatus::Pending);
        running.transition_to(BuildStatus::Running);
        let running = store.update_build(running).await.unwrap();

        // Current version, but a backwards move
        let mut regressed = running;
        regressed.status = BuildStatus::Pending;
        let result = store.update_build(regressed).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        let stored = store.get("default", "dataBuild").await.unwrap();
        assert_eq!(stored.status, BuildStatus::Running);
    }

    #[tokio::test]
    async fn test_update_unknown_build() {
        let result = store().update_build(docker_build("ghost")).await;
        assert_eq!(result, Err(StoreError::NotFound("default/ghost".to_string())));
    }

    #[tokio::test]
    async fn test_update_keeps_parameters() {
        let store = store();
        let build = store.create(docker_build("dataBuild")).await.unwrap();

        let mut changed = build.clone();
        changed.parameters.output.image_tag = "other/tag".to_string();
        store.update_build(changed).await.unwrap();

        let stored = store.get("default", "dataBuild").await.unwrap();
        assert_eq!(stored.parameters, build.parameters);
    }

    #[tokio::test]
    async fn test_find_by_pod_name() {
        let store = store();
        let mut build = store.create(docker_build("dataBuild")).await.unwrap();
        build.transition_to(BuildStatus::Pending);
        build.pod_name = Some("p1".to_string());
        store.update_build(build).await.unwrap();

        let found = store.find_by_pod_name("default", "p1").await.unwrap();
        assert_eq!(found.map(|b| b.name), Some("dataBuild".to_string()));

        assert!(store.find_by_pod_name("other", "p1").await.unwrap().is_none());
        assert!(store.find_by_pod_name("default", "p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_by_creation() {
        let store = store();
        store.create(docker_build("first")).await.unwrap();
        store.create(docker_build("second")).await.unwrap();

        let names: Vec<String> = store.list().await.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }
}
