//! The worker dispatch loop.
//!
//! A worker repeatedly signals readiness on its currently-active reservation
//! port and acts on the reply: shut down, back off, execute a substep batch
//! in place, or drive a step/workflow as a resumable computation. While a
//! computation is suspended on an event that is not ready, the worker pushes
//! a nesting level (a fresh reservation port and execution context) and
//! services one round of other work addressed to it, so a slow or nested job
//! never deadlocks the worker against independent work.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{sync::watch, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    bridge::BridgeClient,
    config::RunConfig,
    executor::{ExecContext, ExecError, ExecSignal, WorkExecutor},
    messages::{
        ArgsPayload, ControlReply, ExecutorUpdate, MessageError, ReservationPort, SubstepBatch,
        WorkRequest,
    },
};

/// Worker-fatal failures. A killed worker exits cleanly; the manager's
/// liveness sweep turns the gap into a pool-fatal condition.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker received a kill signal")]
    Killed,
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Worker process entry options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub bridge_addr: SocketAddr,
    pub worker_id: u64,
    pub run_config: RunConfig,
    pub args: ArgsPayload,
    /// Backoff after an empty reply
    pub idle_backoff: Duration,
    /// Poll window on a suspend handle before servicing other work
    pub suspend_poll: Duration,
}

impl WorkerOptions {
    pub fn new(bridge_addr: SocketAddr, worker_id: u64) -> Self {
        Self {
            bridge_addr,
            worker_id,
            run_config: RunConfig::default(),
            args: ArgsPayload::default(),
            idle_backoff: Duration::from_millis(100),
            suspend_poll: Duration::from_millis(200),
        }
    }

    /// Parse options from worker command-line arguments:
    /// `--bridge <addr> --worker-id <id> [--run-config <json>]`.
    pub fn from_cli_args<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        use anyhow::{Context, bail};

        let mut bridge_addr = None;
        let mut worker_id = None;
        let mut run_config = RunConfig::default();

        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let value = args
                .next()
                .with_context(|| format!("missing value for {flag}"))?;
            match flag.as_str() {
                "--bridge" => {
                    bridge_addr = Some(value.parse().context("invalid --bridge address")?)
                }
                "--worker-id" => {
                    worker_id = Some(value.parse().context("invalid --worker-id")?)
                }
                "--run-config" => {
                    run_config =
                        serde_json::from_str(&value).context("invalid --run-config json")?
                }
                other => bail!("unknown worker option: {other}"),
            }
        }

        let bridge_addr = bridge_addr.context("--bridge is required")?;
        let worker_id = worker_id.context("--worker-id is required")?;
        let mut options = Self::new(bridge_addr, worker_id);
        options.run_config = run_config;
        Ok(options)
    }
}

/// One worker's dispatch loop and nesting state.
pub struct Worker {
    client: BridgeClient,
    executors: Arc<dyn WorkExecutor>,
    options: WorkerOptions,
    /// Reservation ports, index = nesting depth
    ports: Vec<ReservationPort>,
    /// Execution contexts, index = nesting depth
    contexts: Vec<ExecContext>,
    depth: usize,
    kill: watch::Receiver<bool>,
}

impl Worker {
    /// Connect to the bridge and set up the root nesting level.
    pub async fn connect(
        options: WorkerOptions,
        executors: Arc<dyn WorkExecutor>,
        kill: watch::Receiver<bool>,
    ) -> Result<Self, WorkerError> {
        let client = BridgeClient::connect(options.bridge_addr, options.worker_id).await?;
        let root_port = ReservationPort::derive(options.worker_id, 0);
        let root_ctx = ExecContext::new(options.args.clone(), options.run_config.clone());
        Ok(Self {
            client,
            executors,
            options,
            ports: vec![root_port],
            contexts: vec![root_ctx],
            depth: 0,
            kill,
        })
    }

    /// Run until the manager sends the termination sentinel or a kill signal
    /// arrives. Always runs the executor cleanup hook before returning.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let worker_id = self.options.worker_id;
        info!(worker_id, "worker loop starting");
        let result = loop {
            match self.process_job().await {
                Ok(true) => {}
                Ok(false) => {
                    info!(worker_id, "worker received shutdown sentinel");
                    break Ok(());
                }
                Err(WorkerError::Killed) => {
                    info!(worker_id, "worker killed");
                    break Err(WorkerError::Killed);
                }
                Err(err) => {
                    warn!(worker_id, error = %err, "worker loop failed");
                    break Err(err);
                }
            }
        };
        self.executors.cleanup().await;
        result
    }

    fn current_port(&self) -> ReservationPort {
        self.ports[self.depth]
    }

    /// One dispatch round: signal readiness, wait for the reply, act on it.
    /// Returns `false` when the termination sentinel arrives at the root
    /// depth. Recursive: suspended computations re-enter this at the next
    /// nesting level.
    fn process_job(&mut self) -> BoxFuture<'_, Result<bool, WorkerError>> {
        Box::pin(async move {
            if *self.kill.borrow() {
                return Err(WorkerError::Killed);
            }
            let port = self.current_port();
            let reply = tokio::select! {
                result = self.client.request_work(port) => result?,
                _ = self.kill.changed() => return Err(WorkerError::Killed),
            };

            match reply {
                ControlReply::Shutdown => {
                    if self.depth > 0 {
                        // mid-job: the in-flight outer request runs to
                        // completion; only an external kill interrupts it
                        debug!(%port, depth = self.depth, "ignoring sentinel at nested depth");
                        return Ok(true);
                    }
                    Ok(false)
                }
                ControlReply::Idle => {
                    tokio::time::sleep(self.options.idle_backoff).await;
                    Ok(true)
                }
                ControlReply::Work(WorkRequest::Substeps(batch)) => {
                    self.run_substeps(port, batch).await?;
                    Ok(true)
                }
                ControlReply::Work(request) => {
                    self.run_delegated(port, request).await?;
                    Ok(true)
                }
            }
        })
    }

    /// Execute a substep batch synchronously in place. Individual failures
    /// are reported per unit and do not stop the batch.
    async fn run_substeps(
        &mut self,
        port: ReservationPort,
        batch: SubstepBatch,
    ) -> Result<(), WorkerError> {
        let executors = Arc::clone(&self.executors);
        for (substep_id, unit) in &batch.units {
            let outcome = executors
                .substep(substep_id, unit, &self.contexts[self.depth])
                .await;
            let update = match outcome {
                Ok(()) => ExecutorUpdate::SubstepCompleted {
                    substep_id: substep_id.clone(),
                    error: None,
                },
                Err(err) => {
                    warn!(%port, %substep_id, error = %err, "substep failed");
                    ExecutorUpdate::SubstepCompleted {
                        substep_id: substep_id.clone(),
                        error: Some(err.to_string()),
                    }
                }
            };
            self.client.send_update(port, update).await?;
        }
        Ok(())
    }

    /// Drive a step or workflow as a resumable computation. Failures are
    /// forwarded to the requester; the worker itself survives.
    async fn run_delegated(
        &mut self,
        port: ReservationPort,
        request: WorkRequest,
    ) -> Result<(), WorkerError> {
        let executors = Arc::clone(&self.executors);
        let mut runner = {
            let started = match request {
                WorkRequest::Step(step) => {
                    debug!(%port, section = %step.section, "running step");
                    self.contexts[self.depth] = ExecContext::for_step(&step);
                    executors.step(step, &mut self.contexts[self.depth])
                }
                WorkRequest::Workflow(workflow) => {
                    debug!(%port, workflow = %workflow.name, "running workflow");
                    self.contexts[self.depth] = ExecContext::for_workflow(&workflow);
                    executors.workflow(workflow, &mut self.contexts[self.depth])
                }
                WorkRequest::Substeps(_) => unreachable!("substeps are executed in place"),
            };
            match started {
                Ok(runner) => runner,
                Err(err) => {
                    self.forward_failure(port, &err).await?;
                    return Ok(());
                }
            }
        };

        let mut input = None;
        loop {
            match runner.resume(input.take()).await {
                Ok(ExecSignal::Complete) => break,
                Ok(ExecSignal::Yield) => continue,
                Ok(ExecSignal::Pending(mut handle)) => loop {
                    match timeout(self.options.suspend_poll, handle.wait()).await {
                        Ok(Some(value)) => {
                            input = Some(value);
                            break;
                        }
                        Ok(None) => {
                            self.forward_failure(port, &ExecError::EventClosed).await?;
                            return Ok(());
                        }
                        Err(_) => {
                            // not ready: serve other work addressed to this
                            // worker one level down, then re-poll
                            self.push_level();
                            let served = self.process_job().await;
                            self.pop_level();
                            served?;
                        }
                    }
                },
                Err(err) => {
                    self.forward_failure(port, &err).await?;
                    break;
                }
            }
        }
        debug!(%port, "request complete");
        Ok(())
    }

    async fn forward_failure(
        &mut self,
        port: ReservationPort,
        err: &ExecError,
    ) -> Result<(), WorkerError> {
        warn!(%port, error = %err, "delegated execution failed; forwarding");
        self.client
            .send_update(
                port,
                ExecutorUpdate::Failed {
                    message: err.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    fn push_level(&mut self) {
        self.depth += 1;
        if self.ports.len() <= self.depth {
            self.ports
                .push(ReservationPort::derive(self.options.worker_id, self.depth as u32));
            self.contexts.push(ExecContext::new(
                ArgsPayload::default(),
                self.options.run_config.clone(),
            ));
        }
    }

    fn pop_level(&mut self) {
        self.depth -= 1;
    }
}

/// Worker process entry: install the kill-signal handler, connect, run the
/// dispatch loop, clean up. Consumers build their worker binary around this.
pub async fn run_worker(
    options: WorkerOptions,
    executors: Arc<dyn WorkExecutor>,
) -> anyhow::Result<()> {
    let (kill_tx, kill_rx) = watch::channel(false);
    spawn_kill_signal_task(kill_tx);

    let worker = Worker::connect(options, executors, kill_rx).await?;
    match worker.run().await {
        Ok(()) => Ok(()),
        // orderly exit from the worker's perspective; the manager decides
        // whether the gap is pool-fatal
        Err(WorkerError::Killed) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn spawn_kill_signal_task(kill_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                let _ = kill_tx.send(true);
            }
            Err(err) => warn!(?err, "failed to install SIGTERM handler"),
        }
    });
}

#[cfg(not(unix))]
fn spawn_kill_signal_task(kill_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = kill_tx.send(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_parse() {
        let options = WorkerOptions::from_cli_args(
            [
                "--bridge",
                "127.0.0.1:9000",
                "--worker-id",
                "4",
                "--run-config",
                r#"{"config_file":null,"output_dag":null,"run_mode":"dryrun","verbosity":1,"sig_mode":"ignore"}"#,
            ]
            .map(String::from),
        )
        .expect("parse");
        assert_eq!(options.worker_id, 4);
        assert_eq!(options.bridge_addr.port(), 9000);
        assert_eq!(options.run_config.verbosity, 1);
    }

    #[test]
    fn cli_args_reject_unknown_flags() {
        let result =
            WorkerOptions::from_cli_args(["--frobnicate", "yes"].map(String::from));
        assert!(result.is_err());

        let result = WorkerOptions::from_cli_args(["--bridge"].map(String::from));
        assert!(result.is_err());
    }
}
