//! The owning supervisory loop.
//!
//! [`Supervisor`] wraps a [`WorkerManager`] in a background task that polls
//! readiness signals, routes them through `process_request`, runs the
//! periodic `check_workers` maintenance, serves submissions arriving through
//! a [`PoolHandle`], and shuts the pool down on request. Per-request
//! failures are logged and absorbed (fail-open); a liveness fault is
//! pool-fatal and surfaces from [`Supervisor::shutdown`].

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    manager::{PoolError, WorkerManager},
    messages::{MessageError, ReservationPort, WorkRequest},
    status::{PoolStatus, PoolTimeSeries, TimeSeriesEntry},
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Readiness poll window per loop pass
    pub poll_interval: Duration,
    /// Gap between status snapshots fed into the time series
    pub status_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            status_interval: Duration::from_secs(5),
        }
    }
}

enum PoolCommand {
    AddRequest {
        port: Option<ReservationPort>,
        request: WorkRequest,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    WorkerAvailable {
        reply: oneshot::Sender<Result<Option<ReservationPort>, PoolError>>,
    },
}

/// Submission side of a supervised pool. Cheap to clone.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    /// See [`WorkerManager::add_request`].
    pub async fn add_request(
        &self,
        port: Option<ReservationPort>,
        request: WorkRequest,
    ) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::AddRequest {
                port,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PoolError::Message(MessageError::ChannelClosed))?;
        reply_rx
            .await
            .map_err(|_| PoolError::Message(MessageError::ChannelClosed))?
    }

    /// See [`WorkerManager::worker_available`].
    pub async fn worker_available(&self) -> Result<Option<ReservationPort>, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::WorkerAvailable { reply: reply_tx })
            .await
            .map_err(|_| PoolError::Message(MessageError::ChannelClosed))?;
        reply_rx
            .await
            .map_err(|_| PoolError::Message(MessageError::ChannelClosed))?
    }
}

/// Handle to the running supervisory loop.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<PoolStatus>,
    commands: mpsc::Sender<PoolCommand>,
    series: Arc<Mutex<PoolTimeSeries>>,
    handle: JoinHandle<Result<(), PoolError>>,
}

impl Supervisor {
    pub fn start(manager: WorkerManager, config: SupervisorConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(manager.status());
        let (commands, commands_rx) = mpsc::channel(64);
        let series = Arc::new(Mutex::new(PoolTimeSeries::new()));

        let task = SupervisorTask {
            manager,
            config,
            shutdown_rx,
            commands_rx,
            status_tx,
            series: Arc::clone(&series),
            last_snapshot: Instant::now(),
            last_processed: 0,
        };
        let handle = tokio::spawn(async move {
            let result = task.run().await;
            if let Err(err) = &result {
                error!(error = %err, "supervisor terminated with error");
            }
            result
        });

        Self {
            shutdown_tx,
            status_rx,
            commands,
            series,
            handle,
        }
    }

    /// Submission handle for the owning process.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            commands: self.commands.clone(),
        }
    }

    /// Latest pool status snapshot.
    pub fn status(&self) -> PoolStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel carrying status snapshots.
    pub fn status_watch(&self) -> watch::Receiver<PoolStatus> {
        self.status_rx.clone()
    }

    /// Copy of the accumulated diagnostics time series.
    pub fn time_series(&self) -> PoolTimeSeries {
        self.series.lock().expect("time series lock poisoned").clone()
    }

    /// Ask the loop to stop without waiting for it.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the loop, kill the pool, and surface any pool-fatal error.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => Ok(result?),
            Err(err) => Err(anyhow!("supervisor task panicked: {err}")),
        }
    }
}

struct SupervisorTask {
    manager: WorkerManager,
    config: SupervisorConfig,
    shutdown_rx: watch::Receiver<bool>,
    commands_rx: mpsc::Receiver<PoolCommand>,
    status_tx: watch::Sender<PoolStatus>,
    series: Arc<Mutex<PoolTimeSeries>>,
    last_snapshot: Instant,
    last_processed: u64,
}

impl SupervisorTask {
    async fn run(mut self) -> Result<(), PoolError> {
        info!(
            poll_ms = self.config.poll_interval.as_millis(),
            "pool supervisor starting"
        );
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let polled = tokio::select! {
                port = self.manager.poll_signal(self.config.poll_interval) => port,
                command = self.commands_rx.recv() => {
                    if let Some(command) = command {
                        self.serve_command(command).await;
                    }
                    None
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    None
                }
            };

            if let Some(port) = polled {
                // fail-open: a single bad exchange must not stop the loop
                if let Err(err) = self.manager.process_request(port).await {
                    warn!(%port, error = %err, "request processing failed");
                }
            }

            self.manager.check_workers().await?;
            self.publish_status();
        }

        info!("supervisor shutting down pool");
        self.manager.kill_all().await;
        self.publish_status();
        Ok(())
    }

    async fn serve_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::AddRequest {
                port,
                request,
                reply,
            } => {
                let result = self.manager.add_request(port, request).await;
                let _ = reply.send(result);
            }
            PoolCommand::WorkerAvailable { reply } => {
                let result = self.manager.worker_available().await;
                let _ = reply.send(result);
            }
        }
    }

    fn publish_status(&mut self) {
        let snapshot = self.manager.status();

        if self.last_snapshot.elapsed() >= self.config.status_interval {
            let elapsed = self.last_snapshot.elapsed().as_secs_f32().max(f32::EPSILON);
            let dispatched = snapshot.processed.saturating_sub(self.last_processed);
            let entry = TimeSeriesEntry::from_status(
                &snapshot,
                chrono::Utc::now().timestamp(),
                dispatched as f32 / elapsed,
            );
            self.series
                .lock()
                .expect("time series lock poisoned")
                .push(entry);
            self.last_snapshot = Instant::now();
            self.last_processed = snapshot.processed;
        }

        self.status_tx.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }
}
