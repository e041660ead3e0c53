//! Worker launch seam.
//!
//! The manager spawns workers through a [`WorkerLauncher`], which hides
//! whether a worker is a separate OS process ([`ProcessLauncher`]) or an
//! in-process task connected over loopback ([`InlineLauncher`], used by
//! tests and single-process embeddings). Either way the manager holds a
//! [`WorkerHandle`] it can probe for liveness and kill.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    bridge::WorkerBridgeServer,
    config::RunConfig,
    executor::WorkExecutor,
    manager::PoolError,
    worker::{Worker, WorkerOptions},
};

/// Handle to a live worker, owned by the manager for lifecycle decisions.
pub enum WorkerHandle {
    /// A separate OS process
    Process(Child),
    /// An in-process worker task with its kill switch
    Inline {
        handle: JoinHandle<()>,
        kill: watch::Sender<bool>,
    },
}

impl WorkerHandle {
    /// Whether the worker is still running.
    pub fn is_alive(&mut self) -> bool {
        match self {
            WorkerHandle::Process(child) => matches!(child.try_wait(), Ok(None)),
            WorkerHandle::Inline { handle, .. } => !handle.is_finished(),
        }
    }

    /// Request immediate termination, without waiting for it to complete.
    pub fn start_kill(&mut self) {
        match self {
            WorkerHandle::Process(child) => {
                if let Err(err) = child.start_kill() {
                    warn!(?err, "failed to kill worker process");
                }
            }
            WorkerHandle::Inline { kill, .. } => {
                let _ = kill.send(true);
            }
        }
    }
}

/// Spawns one worker per call.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> BoxFuture<'_, Result<WorkerHandle, PoolError>>;
}

/// Launches workers as OS processes running the configured worker command.
///
/// The command is expected to parse `--bridge`, `--worker-id` and
/// `--run-config` and call [`crate::worker::run_worker`].
pub struct ProcessLauncher {
    pub command: PathBuf,
    pub bridge: Arc<WorkerBridgeServer>,
    pub run_config: RunConfig,
}

impl ProcessLauncher {
    pub fn new(command: PathBuf, bridge: Arc<WorkerBridgeServer>) -> Self {
        Self {
            command,
            bridge,
            run_config: RunConfig::default(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<WorkerHandle, PoolError>> {
        Box::pin(async move {
            let worker_id = self.bridge.allocate_worker_id();
            let run_config = serde_json::to_string(&self.run_config)
                .map_err(|err| PoolError::Launch(err.to_string()))?;

            let mut command = Command::new(&self.command);
            command
                .arg("--bridge")
                .arg(self.bridge.addr().to_string())
                .arg("--worker-id")
                .arg(worker_id.to_string())
                .arg("--run-config")
                .arg(run_config)
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            let child = command
                .spawn()
                .map_err(|err| PoolError::Launch(err.to_string()))?;

            info!(
                pid = child.id(),
                worker_id,
                command = %self.command.display(),
                "spawned worker process"
            );
            Ok(WorkerHandle::Process(child))
        })
    }
}

/// Runs workers as in-process tasks connected to the bridge over loopback.
pub struct InlineLauncher {
    pub bridge: Arc<WorkerBridgeServer>,
    pub executors: Arc<dyn WorkExecutor>,
    pub run_config: RunConfig,
    /// Worker backoff after an empty reply
    pub idle_backoff: Duration,
    /// Worker suspend-handle poll window
    pub suspend_poll: Duration,
}

impl InlineLauncher {
    pub fn new(bridge: Arc<WorkerBridgeServer>, executors: Arc<dyn WorkExecutor>) -> Self {
        Self {
            bridge,
            executors,
            run_config: RunConfig::default(),
            idle_backoff: Duration::from_millis(100),
            suspend_poll: Duration::from_millis(200),
        }
    }
}

impl WorkerLauncher for InlineLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<WorkerHandle, PoolError>> {
        Box::pin(async move {
            let worker_id = self.bridge.allocate_worker_id();
            let (kill_tx, kill_rx) = watch::channel(false);

            let mut options = WorkerOptions::new(self.bridge.addr(), worker_id);
            options.run_config = self.run_config.clone();
            options.idle_backoff = self.idle_backoff;
            options.suspend_poll = self.suspend_poll;

            let executors = Arc::clone(&self.executors);
            let worker = Worker::connect(options, executors, kill_rx)
                .await
                .map_err(|err| PoolError::Launch(err.to_string()))?;

            let handle = tokio::spawn(async move {
                if let Err(err) = worker.run().await {
                    warn!(worker_id, error = %err, "inline worker exited with error");
                }
            });

            info!(worker_id, "spawned inline worker");
            Ok(WorkerHandle::Inline {
                handle,
                kill: kill_tx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_launch_failure_is_typed() {
        let (bridge, _channels) = WorkerBridgeServer::start(None).await.expect("start");
        let launcher = ProcessLauncher::new(
            PathBuf::from("/nonexistent/belay-worker-test-binary"),
            Arc::clone(&bridge),
        );
        let result = launcher.launch().await;
        assert!(matches!(result, Err(PoolError::Launch(_))));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn inline_handle_reports_liveness() {
        let (kill_tx, mut kill_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            while kill_rx.changed().await.is_ok() {
                if *kill_rx.borrow() {
                    break;
                }
            }
        });
        let mut handle = WorkerHandle::Inline {
            handle: task,
            kill: kill_tx,
        };
        assert!(handle.is_alive());
        handle.start_kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_alive());
    }
}
