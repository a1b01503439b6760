//! Running long-lived worker tasks under one shutdown token.
//!
//! Every task gets a clone of the shared `CancellationToken`. A watcher per
//! task reports abnormal endings (an error, a panic, or returning while the
//! token is still live) on an mpsc channel. The first report cancels all
//! remaining tasks and becomes the result of `wait`.

use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("task {name} failed: {source}")]
    TaskFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {name} panicked")]
    TaskPanicked { name: String },

    #[error("task {name} exited before shutdown")]
    TaskExited { name: String },
}

impl SupervisorError {
    pub fn task_name(&self) -> &str {
        match self {
            SupervisorError::TaskFailed { name, .. }
            | SupervisorError::TaskPanicked { name }
            | SupervisorError::TaskExited { name } => name,
        }
    }
}

pub struct Supervisor {
    shutdown: CancellationToken,
    failures_tx: mpsc::UnboundedSender<SupervisorError>,
    failures_rx: mpsc::UnboundedReceiver<SupervisorError>,
    watchers: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            shutdown,
            failures_tx,
            failures_rx,
            watchers: Vec::new(),
        }
    }

    /// Spawn a task that runs until the token passed to it is cancelled
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let token = self.shutdown.clone();
        let failures = self.failures_tx.clone();
        let handle = tokio::spawn(task(token.clone()));

        info!(task = %name, "Started task");

        self.watchers.push(tokio::spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) if token.is_cancelled() => {
                    info!(task = %name, "Task stopped");
                    None
                }
                Ok(Ok(())) => Some(SupervisorError::TaskExited { name }),
                Ok(Err(source)) => Some(SupervisorError::TaskFailed { name, source }),
                Err(e) if e.is_panic() => Some(SupervisorError::TaskPanicked { name }),
                Err(_) => Some(SupervisorError::TaskExited { name }),
            };

            if let Some(failure) = failure {
                let _ = failures.send(failure);
            }
        }));
    }

    /// Wait for shutdown or the first task failure, then stop every task
    pub async fn wait(mut self) -> Result<(), SupervisorError> {
        // Only watchers hold senders from here on
        drop(self.failures_tx);

        let mut first = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            failure = self.failures_rx.recv() => failure,
        };

        if let Some(ref failure) = first {
            error!(task = %failure.task_name(), error = %failure, "Task ended abnormally, stopping all tasks");
        }
        self.shutdown.cancel();

        for watcher in self.watchers {
            let _ = watcher.await;
        }

        // Failures raised while draining
        while let Ok(failure) = self.failures_rx.try_recv() {
            if first.is_none() {
                error!(task = %failure.task_name(), error = %failure, "Task failed during shutdown");
                first = Some(failure);
            }
        }

        match first {
            Some(failure) => Err(failure),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn until_cancelled(token: CancellationToken, stopped: Arc<AtomicBool>) -> anyhow::Result<()> {
        token.cancelled().await;
        stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fail(message: &'static str) -> anyhow::Result<()> {
        anyhow::bail!(message)
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    async fn return_early() -> anyhow::Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_cancels_other_tasks() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new(CancellationToken::new());
        let flag = stopped.clone();
        supervisor.spawn("consumer-0", move |token| until_cancelled(token, flag));
        supervisor.spawn("consumer-1", |_| fail("stream ended"));

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, SupervisorError::TaskFailed { ref name, .. } if name == "consumer-1"));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let mut supervisor = Supervisor::new(CancellationToken::new());
        supervisor.spawn("consumer-0", |_| explode());

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, SupervisorError::TaskPanicked { .. }));
        assert_eq!(err.task_name(), "consumer-0");
    }

    #[tokio::test]
    async fn test_early_return_is_a_failure() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new(CancellationToken::new());
        let flag = stopped.clone();
        supervisor.spawn("consumer-0", move |token| until_cancelled(token, flag));
        supervisor.spawn("consumer-1", |_| return_early());

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, SupervisorError::TaskExited { .. }));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_tasks_cleanly() {
        let shutdown = CancellationToken::new();
        let flags: Vec<_> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();

        let mut supervisor = Supervisor::new(shutdown.clone());
        for (i, flag) in flags.iter().enumerate() {
            let flag = flag.clone();
            supervisor.spawn(format!("consumer-{}", i), move |token| {
                until_cancelled(token, flag)
            });
        }

        shutdown.cancel();
        supervisor.wait().await.unwrap();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_error_during_shutdown_is_reported() {
        let shutdown = CancellationToken::new();
        let mut supervisor = Supervisor::new(shutdown.clone());
        supervisor.spawn("consumer-0", |token| async move {
            token.cancelled().await;
            fail("final commit failed").await
        });

        shutdown.cancel();
        assert!(matches!(
            supervisor.wait().await,
            Err(SupervisorError::TaskFailed { .. })
        ));
    }
}
