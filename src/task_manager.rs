//! Tracks the daemon's long-running tasks and awaits them on shutdown.
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Spawns named tasks that share one shutdown channel.
///
/// Every task is expected to watch the receiver handed out by
/// [`TaskManager::shutdown_rx`] and return once it flips to `true`.
#[derive(Clone, Debug)]
pub struct TaskManager {
    tasks: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of tasks not yet awaited.
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Awaits every task and returns how many of them panicked.
    pub async fn shutdown(self) -> usize {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        info!(count = tasks.len(), "Waiting for daemon tasks to finish");

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut panicked = 0;
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name = name, "Task finished"),
                Err(e) => {
                    error!(task_name = name, error = %e, "Task panicked");
                    panicked += 1;
                }
            }
        }

        if panicked == 0 {
            info!("All daemon tasks finished");
        }
        panicked
    }
}
