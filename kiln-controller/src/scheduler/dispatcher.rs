//! Dispatch loop
//!
//! Pulls build and pod events from their sources and hands each one to the
//! controller in its own task, so a panic or error while handling one item
//! never stops the loop.
//!
//! Two modes are supported:
//! - Sequential: one loop alternates between the build and pod sources and
//!   waits for each item before pulling the next.
//! - Concurrent: one loop per source; items run in parallel, bounded by
//!   `max_in_flight`.
//!
//! Every reconciliation is reported here. When the controller could not
//! persist a transition, the dispatcher keeps trying to store the returned
//! build with capped exponential backoff, unless the store refused it as
//! stale.

use kiln_core::domain::build::Build;
use kiln_core::domain::pod::Pod;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::controller::{BuildController, Reconciliation};
use crate::error::{ControllerError, StoreError};
use crate::repository::{BuildSource, BuildUpdater, PodSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sequential,
    Concurrent,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(DispatchMode::Sequential),
            "concurrent" => Ok(DispatchMode::Concurrent),
            other => Err(format!("unknown dispatch mode: {}", other)),
        }
    }
}

/// Backoff for re-persisting a build the controller could not store
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the controller's own failed write
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    /// Upper bound on items being handled at once
    pub max_in_flight: usize,
    /// Pause after a source reports nothing ready
    pub idle_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Concurrent,
            max_in_flight: 4,
            idle_interval: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Dispatcher {
    controller: Arc<BuildController>,
    builds: Arc<dyn BuildSource>,
    pods: Arc<dyn PodSource>,
    updater: Arc<dyn BuildUpdater>,
    config: DispatchConfig,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    /// Creates a new dispatcher
    ///
    /// # Arguments
    /// * `controller` - Handles each event
    /// * `builds` - Source of build events
    /// * `pods` - Source of pod events
    /// * `updater` - Used to retry writes the controller could not make
    /// * `config` - Mode, concurrency and retry settings
    pub fn new(
        controller: Arc<BuildController>,
        builds: Arc<dyn BuildSource>,
        pods: Arc<dyn PodSource>,
        updater: Arc<dyn BuildUpdater>,
        config: DispatchConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            controller,
            builds,
            pods,
            updater,
            config,
            semaphore,
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Starting dispatch loop ({:?})", self.config.mode);

        match self.config.mode {
            DispatchMode::Sequential => self.run_sequential(shutdown).await,
            DispatchMode::Concurrent => {
                let builds = tokio::spawn(Arc::clone(&self).run_build_loop(shutdown.clone()));
                let pods = tokio::spawn(Arc::clone(&self).run_pod_loop(shutdown));

                let (builds, pods) = tokio::join!(builds, pods);
                for (source, result) in [("build", builds), ("pod", pods)] {
                    if let Err(e) = result {
                        error!("The {} loop stopped abnormally: {}", source, e);
                    }
                }
            }
        }

        info!("Dispatch loop stopped");
    }

    /// Pulls one build and waits for it to be handled
    ///
    /// Returns `false` when the source had nothing ready.
    pub async fn process_next_build(&self) -> bool {
        let Some(build) = self.builds.next_build().await else {
            return false;
        };

        let name = build.name.clone();
        let handle = self.spawn_build(build).await;
        report_join(handle.await, "build", &name);
        true
    }

    /// Pulls one pod and waits for it to be handled
    ///
    /// Returns `false` when the source had nothing ready.
    pub async fn process_next_pod(&self) -> bool {
        let Some(pod) = self.pods.next_pod().await else {
            return false;
        };

        let name = pod.name.clone();
        let handle = self.spawn_pod(pod).await;
        report_join(handle.await, "pod", &name);
        true
    }

    async fn run_sequential(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let handled_build = tokio::select! {
                handled = self.process_next_build() => handled,
                _ = shutdown.changed() => break,
            };
            let handled_pod = tokio::select! {
                handled = self.process_next_pod() => handled,
                _ = shutdown.changed() => break,
            };

            if !handled_build && !handled_pod && !self.idle(&mut shutdown).await {
                break;
            }
        }
    }

    async fn run_build_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                next = self.builds.next_build() => next,
                _ = shutdown.changed() => break,
            };

            match next {
                Some(build) => {
                    let name = build.name.clone();
                    let handle = self.spawn_build(build).await;
                    supervise(handle, "build", name);
                }
                None => {
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!("Build loop stopped");
    }

    async fn run_pod_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                next = self.pods.next_pod() => next,
                _ = shutdown.changed() => break,
            };

            match next {
                Some(pod) => {
                    let name = pod.name.clone();
                    let handle = self.spawn_pod(pod).await;
                    supervise(handle, "pod", name);
                }
                None => {
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!("Pod loop stopped");
    }

    /// Sleeps for the idle interval; returns `false` if shutdown arrived
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_interval) => true,
            _ = shutdown.changed() => false,
        }
    }

    /// Waits for a free slot
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(e) => {
                warn!("Dispatch semaphore closed, running without a slot: {}", e);
                None
            }
        }
    }

    async fn spawn_build(&self, build: Build) -> JoinHandle<()> {
        let permit = self.acquire().await;
        let controller = Arc::clone(&self.controller);
        let updater = Arc::clone(&self.updater);
        let retry = self.config.retry.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = controller.handle_build(build).await;
            settle(result, updater, retry).await;
        })
    }

    async fn spawn_pod(&self, pod: Pod) -> JoinHandle<()> {
        let permit = self.acquire().await;
        let controller = Arc::clone(&self.controller);
        let updater = Arc::clone(&self.updater);
        let retry = self.config.retry.clone();

        tokio::spawn(async move {
            let _permit = permit;
            match controller.handle_pod(&pod).await {
                Ok(Some(result)) => settle(result, updater, retry).await,
                Ok(None) => {}
                Err(e) => warn!("Failed to handle pod {}: {}", pod.name, e),
            }
        })
    }
}

/// Finishes a reconciliation: reports it, then retries persistence if the
/// controller's write failed for a reason other than a stale copy
async fn settle(result: Reconciliation, updater: Arc<dyn BuildUpdater>, retry: RetryPolicy) {
    match outcome(&result) {
        Some(message) if result.cause.is_some() => warn!("{}", message),
        Some(message) => info!("{}", message),
        None => {}
    }

    match &result.persist_error {
        None => {}
        Some(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
            warn!("Dropping update of build {}: {}", result.build.name, e);
        }
        Some(_) => {
            persist_with_retry(updater.as_ref(), result.build, &retry).await;
        }
    }
}

/// Describes what handling an event did to its build, if anything
fn outcome(result: &Reconciliation) -> Option<String> {
    let build = &result.build;

    match &result.cause {
        Some(ControllerError::CreatePod(e)) if e.is_already_exists() => Some(format!(
            "Build {} failed: {} (pod left by an earlier delivery)",
            build.name, e
        )),
        Some(cause) => Some(format!("Build {} failed: {}", build.name, cause)),
        None if result.changed() => Some(format!(
            "Build {} moved from {} to {}",
            build.name, result.previous, build.status
        )),
        None => None,
    }
}

/// Re-submits a build with capped exponential backoff
///
/// Gives up early when the store holds a newer record or no longer knows
/// the build. Returns whether the build was stored.
pub async fn persist_with_retry(
    updater: &dyn BuildUpdater,
    build: Build,
    policy: &RetryPolicy,
) -> bool {
    let mut delay = policy.initial_backoff;

    for attempt in 1..=policy.retries {
        tokio::time::sleep(delay).await;

        match updater.update_build(build.clone()).await {
            Ok(_) => {
                info!(
                    "Persisted build {} as {} after {} retr{}",
                    build.name,
                    build.status,
                    attempt,
                    if attempt == 1 { "y" } else { "ies" }
                );
                return true;
            }
            Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                warn!("Dropping update of build {}: {}", build.name, e);
                return false;
            }
            Err(e) => {
                warn!(
                    "Failed to persist build {} (attempt {}/{}): {}",
                    build.name, attempt, policy.retries, e
                );
                delay = (delay * 2).min(policy.max_backoff);
            }
        }
    }

    error!(
        "Giving up on persisting build {} as {}",
        build.name, build.status
    );
    false
}

/// Logs the join result of a detached task without blocking the loop
fn supervise(handle: JoinHandle<()>, kind: &'static str, name: String) {
    tokio::spawn(async move {
        report_join(handle.await, kind, &name);
    });
}

fn report_join(result: Result<(), JoinError>, kind: &str, name: &str) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Handler for {} {} panicked: {}", kind, name, e);
        } else {
            warn!("Handler for {} {} was cancelled: {}", kind, name, e);
        }
    }
}
