//! Pods repository
//!
//! Pod submission to the cluster and the feed of observed pod states.

use async_trait::async_trait;
use kiln_core::domain::pod::Pod;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::error::CreatePodError;

/// Submits pods to the cluster
#[async_trait]
pub trait PodCreator: Send + Sync {
    /// # Errors
    /// [`CreatePodError::AlreadyExists`] when a pod with the same name is
    /// already present, [`CreatePodError::Failed`] for anything else.
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, CreatePodError>;
}

/// Pull-based feed of observed pods
#[async_trait]
pub trait PodSource: Send + Sync {
    /// Returns the next observed pod, or `None` when nothing is ready
    async fn next_pod(&self) -> Option<Pod>;
}

/// Queue of pod observations pushed by a watcher
pub struct MemoryPodQueue {
    tx: mpsc::UnboundedSender<Pod>,
    rx: Mutex<mpsc::UnboundedReceiver<Pod>>,
    poll_timeout: Duration,
}

impl MemoryPodQueue {
    pub fn new(poll_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            poll_timeout,
        }
    }

    /// Pushes an observed pod; returns `false` if the queue is closed
    pub fn push(&self, pod: Pod) -> bool {
        self.tx.send(pod).is_ok()
    }
}

#[async_trait]
impl PodSource for MemoryPodQueue {
    async fn next_pod(&self) -> Option<Pod> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(self.poll_timeout, rx.recv())
            .await
            .ok()
            .flatten()
    }
}
