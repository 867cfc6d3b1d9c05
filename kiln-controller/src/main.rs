//! Kiln Controller
//!
//! Reconciles builds against the pods that execute them.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Strategies: Turn a build into the pod that runs it (Docker or STI)
//! - Repositories: Build store, pod feed and pod submission
//! - Controller: Moves builds through their lifecycle
//! - Scheduler: Dispatches build and pod events to the controller
//! - Podman: Local cluster backend and pod watcher
//! - API: Build submission and inspection over HTTP

mod api;
mod config;
mod controller;
mod error;
mod podman;
mod repository;
mod scheduler;
mod strategy;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::controller::BuildController;
use crate::podman::{PodmanPodCreator, PodmanPodWatcher};
use crate::repository::{MemoryBuildStore, MemoryPodQueue};
use crate::scheduler::Dispatcher;
use crate::strategy::{DockerBuildStrategy, SourceBuildStrategy, StrategySelector};

/// How long an event source waits before reporting nothing ready
const SOURCE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_controller=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Controller");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: namespace={}, dispatch_mode={:?}, max_in_flight={}",
        config.namespace, config.dispatch_mode, config.max_in_flight
    );

    if let Err(e) = podman::check_podman_available(&config.podman_binary).await {
        warn!("{:#}", e);
        warn!("Builds will fail until podman is available");
    }

    // Stores and feeds
    let store = Arc::new(MemoryBuildStore::new(SOURCE_POLL_TIMEOUT));
    let pod_queue = Arc::new(MemoryPodQueue::new(SOURCE_POLL_TIMEOUT));

    // Controller
    let strategy = StrategySelector::new(
        DockerBuildStrategy::new(&config.docker_builder_image, &config.docker_socket),
        SourceBuildStrategy::new(&config.sti_builder_image, &config.docker_socket),
    );
    let controller = Arc::new(BuildController::new(
        Arc::new(strategy),
        Arc::new(PodmanPodCreator::new(&config.podman_binary)),
        store.clone(),
        store.clone(),
    ));

    info!("Controller initialized");

    let dispatcher = Arc::new(Dispatcher::new(
        controller,
        store.clone(),
        pod_queue.clone(),
        store.clone(),
        config.dispatch_config(),
    ));
    let watcher = PodmanPodWatcher::new(
        &config.podman_binary,
        store.clone(),
        pod_queue,
        config.watch_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let watch_handle = tokio::spawn(watcher.run(shutdown_rx.clone()));

    // Build router with all API endpoints
    let app = api::create_router(AppState {
        store,
        namespace: config.namespace.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("Listening on {}", config.bind_addr);

    let mut server_shutdown = shutdown_rx;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
                _ = server_shutdown.changed() => {}
            }
        })
        .await
        .context("Server error");

    // Stop the background loops whether the server ended cleanly or not
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("dispatcher", dispatch_handle), ("watcher", watch_handle)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("Kiln Controller stopped");
    served
}

/// Loads configuration from environment variables; unset ones take defaults
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Invalid configuration")?;
    config.validate()?;
    Ok(config)
}
