//! The worker-pool dispatcher.
//!
//! [`WorkerManager`] owns the pool bookkeeping: which reservation ports are
//! available or claimed, the single pending step/workflow request per port,
//! the newest-first substep queue, and the worker records themselves. All of
//! its collections are mutated only from the supervisory task, so no
//! locking is needed around them.
//!
//! Port states: a port is *available* (idle worker, nothing assigned),
//! *claimed* (idle worker earmarked for a request that has not arrived yet),
//! or neither while its worker is busy. A port is never in both sets.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    bridge::{ReadySignal, WorkerBridgeServer},
    launcher::{WorkerHandle, WorkerLauncher},
    messages::{ControlReply, MessageError, ReservationPort, WorkRequest},
    status::PoolStatus,
};

/// Pool-fatal and submission errors raised by the manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker vanished without the orderly shutdown handshake. The pool's
    /// dispatch state can no longer be trusted; this always propagates.
    #[error("a worker exited without the shutdown handshake ({alive} alive, {expected} expected)")]
    WorkerKilled { expected: usize, alive: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("worker launch failed: {0}")]
    Launch(String),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Timing and sizing knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on concurrently live workers
    pub max_workers: usize,
    /// Minimum gap between liveness sweeps
    pub liveness_interval: Duration,
    /// Dispatch-idle period before idle reclamation is considered
    pub idle_grace: Duration,
    /// Bounded poll while draining signals for reclamation
    pub reclaim_poll: Duration,
    /// Bounded poll per attempt while shutting the pool down
    pub kill_poll: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
            liveness_interval: Duration::from_secs(5),
            idle_grace: Duration::from_secs(5),
            reclaim_poll: Duration::from_millis(100),
            kill_poll: Duration::from_secs(1),
        }
    }
}

struct WorkerRecord {
    handle: WorkerHandle,
    spawned_at: Instant,
}

/// Tracks worker liveness and routes work to readiness signals.
pub struct WorkerManager {
    config: ManagerConfig,
    bridge: Arc<WorkerBridgeServer>,
    signals: mpsc::Receiver<ReadySignal>,
    launcher: Arc<dyn WorkerLauncher>,

    workers: Vec<WorkerRecord>,
    num_workers: usize,

    requested: u64,
    processed: u64,

    available_ports: HashSet<ReservationPort>,
    claimed_ports: HashSet<ReservationPort>,
    step_requests: HashMap<ReservationPort, WorkRequest>,
    substep_requests: VecDeque<WorkRequest>,

    last_liveness: Instant,
    last_dispatch: Instant,
}

impl WorkerManager {
    /// Create the manager and spawn the first worker.
    pub async fn new(
        config: ManagerConfig,
        bridge: Arc<WorkerBridgeServer>,
        signals: mpsc::Receiver<ReadySignal>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, PoolError> {
        let now = Instant::now();
        let mut manager = Self {
            config,
            bridge,
            signals,
            launcher,
            workers: Vec::new(),
            num_workers: 0,
            requested: 0,
            processed: 0,
            available_ports: HashSet::new(),
            claimed_ports: HashSet::new(),
            step_requests: HashMap::new(),
            substep_requests: VecDeque::new(),
            last_liveness: now,
            last_dispatch: now,
        };
        manager.start_worker().await?;
        Ok(manager)
    }

    /// Submit work to the pool.
    ///
    /// With no port the request is a substep batch, pushed to the front of
    /// the substep queue (newest-first service). With a port it becomes the
    /// single pending step/workflow request for that exact port, replacing
    /// any previous entry. May opportunistically grow the pool.
    pub async fn add_request(
        &mut self,
        port: Option<ReservationPort>,
        request: WorkRequest,
    ) -> Result<(), PoolError> {
        match (port, request) {
            (None, request @ WorkRequest::Substeps(_)) => {
                self.substep_requests.push_front(request);
            }
            (Some(port), request @ (WorkRequest::Step(_) | WorkRequest::Workflow(_))) => {
                if self.step_requests.insert(port, request).is_some() {
                    debug!(%port, "replaced pending request for port");
                }
            }
            (None, WorkRequest::Step(_) | WorkRequest::Workflow(_)) => {
                return Err(PoolError::InvalidRequest(
                    "step and workflow requests must name a reservation port",
                ));
            }
            (Some(_), WorkRequest::Substeps(_)) => {
                return Err(PoolError::InvalidRequest(
                    "substep batches cannot be bound to a port",
                ));
            }
        }
        self.requested += 1;

        // Grow only once the pool has proven it is dispatching; during
        // startup the initial worker has not signaled yet and spawning here
        // would double it.
        if self.processed > 0
            && self.available_ports.is_empty()
            && self.num_workers < self.config.max_workers
        {
            self.start_worker().await?;
        }
        Ok(())
    }

    /// Claim an available port for a step/workflow about to be submitted.
    ///
    /// Returns `None` when no worker is idle; if the pool is under its cap a
    /// new worker is spawned and the caller waits for its first readiness
    /// signal.
    pub async fn worker_available(&mut self) -> Result<Option<ReservationPort>, PoolError> {
        if let Some(port) = self.available_ports.iter().next().copied() {
            self.available_ports.remove(&port);
            self.claimed_ports.insert(port);
            return Ok(Some(port));
        }
        if self.num_workers < self.config.max_workers {
            self.start_worker().await?;
        }
        Ok(None)
    }

    /// Handle a readiness signal on `port`.
    pub async fn process_request(&mut self, port: ReservationPort) -> Result<(), PoolError> {
        if let Some(request) = self.step_requests.remove(&port) {
            self.bridge.reply(port, ControlReply::Work(request)).await?;
            self.last_dispatch = Instant::now();
            self.processed += 1;
            // the port was claimed for exactly this request
            self.claimed_ports.remove(&port);
            debug!(%port, "dispatched step/workflow request");
        } else if self.claimed_ports.contains(&port) {
            // earmarked for a request that has not arrived yet; keep waiting
            self.bridge.reply(port, ControlReply::Idle).await?;
        } else if let Some(request) = self.substep_requests.pop_front() {
            self.bridge.reply(port, ControlReply::Work(request)).await?;
            self.last_dispatch = Instant::now();
            self.processed += 1;
            // the worker is busy now; it may have been sitting in available
            self.available_ports.remove(&port);
            debug!(%port, "dispatched substep batch");
        } else {
            self.available_ports.insert(port);
            self.bridge.reply(port, ControlReply::Idle).await?;
        }
        Ok(())
    }

    /// Receive the next readiness signal, waiting at most `wait`.
    pub async fn poll_signal(&mut self, wait: Duration) -> Option<ReservationPort> {
        match timeout(wait, self.signals.recv()).await {
            Ok(Some(signal)) => Some(signal.port),
            Ok(None) => {
                debug!("signal channel closed");
                tokio::time::sleep(wait).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Periodic maintenance: liveness sweep and idle-worker reclamation.
    ///
    /// A worker that died without the shutdown handshake makes the whole
    /// pool fail with [`PoolError::WorkerKilled`]. Reclamation runs only
    /// after an idle period with no successful dispatch, retires whichever
    /// idle worker signals readiness next, and never shrinks the pool
    /// below one worker.
    pub async fn check_workers(&mut self) -> Result<(), PoolError> {
        if self.last_liveness.elapsed() >= self.config.liveness_interval {
            self.last_liveness = Instant::now();
            self.workers.retain_mut(|record| record.handle.is_alive());
            if self.workers.len() < self.num_workers {
                return Err(PoolError::WorkerKilled {
                    expected: self.num_workers,
                    alive: self.workers.len(),
                });
            }
        }

        if self.last_dispatch.elapsed() < self.config.idle_grace {
            return Ok(());
        }

        while self.num_workers > 1 {
            let port = match self.poll_signal(self.config.reclaim_poll).await {
                Some(port) => port,
                None => break,
            };
            if self.claimed_ports.contains(&port) {
                self.bridge.reply(port, ControlReply::Idle).await?;
                continue;
            }
            self.available_ports.remove(&port);
            self.bridge.reply(port, ControlReply::Shutdown).await?;
            self.num_workers -= 1;
            info!(%port, live = self.num_workers, "reclaimed idle worker");
        }
        Ok(())
    }

    /// Shut the pool down: answer every readiness signal with the
    /// termination sentinel until no workers remain or a bounded wait
    /// elapses.
    pub async fn kill_all(&mut self) {
        while self.num_workers > 0 {
            let port = match self.poll_signal(self.config.kill_poll).await {
                Some(port) => port,
                None => {
                    warn!(
                        remaining = self.num_workers,
                        "gave up waiting for workers during shutdown"
                    );
                    break;
                }
            };
            if let Err(err) = self.bridge.reply(port, ControlReply::Shutdown).await {
                warn!(%port, error = %err, "worker unreachable during shutdown");
            }
            self.num_workers -= 1;
        }
    }

    /// Snapshot of the pool counters for diagnostics.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            live_workers: self.num_workers,
            requested: self.requested,
            processed: self.processed,
            pending_steps: self.step_requests.len(),
            queued_substeps: self.substep_requests.len(),
            available_ports: self.available_ports.len(),
            claimed_ports: self.claimed_ports.len(),
        }
    }

    async fn start_worker(&mut self) -> Result<(), PoolError> {
        let handle = self.launcher.launch().await?;
        self.workers.push(WorkerRecord {
            handle,
            spawned_at: Instant::now(),
        });
        self.num_workers += 1;
        debug!(live = self.num_workers, "started worker");
        Ok(())
    }

    /// Age of the youngest worker, used by owners that rate-limit spawning.
    pub fn youngest_worker_age(&self) -> Option<Duration> {
        self.workers
            .iter()
            .map(|record| record.spawned_at.elapsed())
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeClient;
    use crate::config::RunConfig;
    use crate::messages::{
        ArgsPayload, SectionRef, StepRequest, SubstepBatch, SubstepUnit, WorkflowRequest,
    };
    use futures::future::BoxFuture;
    use serde_json::Map;
    use tokio::sync::watch;
    use uuid::Uuid;

    /// Launcher whose "workers" are inert tasks that stay alive until killed.
    /// Dispatch flow in these tests is driven by scripted [`BridgeClient`]s.
    struct IdleLauncher;

    impl WorkerLauncher for IdleLauncher {
        fn launch(&self) -> BoxFuture<'_, Result<WorkerHandle, PoolError>> {
            Box::pin(async {
                let (kill_tx, mut kill_rx) = watch::channel(false);
                let handle = tokio::spawn(async move {
                    while kill_rx.changed().await.is_ok() {
                        if *kill_rx.borrow() {
                            break;
                        }
                    }
                });
                Ok(WorkerHandle::Inline {
                    handle,
                    kill: kill_tx,
                })
            })
        }
    }

    /// Launcher whose workers die almost immediately, without handshake.
    struct DyingLauncher;

    impl WorkerLauncher for DyingLauncher {
        fn launch(&self) -> BoxFuture<'_, Result<WorkerHandle, PoolError>> {
            Box::pin(async {
                let (kill_tx, _kill_rx) = watch::channel(false);
                let handle = tokio::spawn(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                });
                Ok(WorkerHandle::Inline {
                    handle,
                    kill: kill_tx,
                })
            })
        }
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            max_workers: 2,
            // effectively disable both background rules unless a test
            // overrides them
            liveness_interval: Duration::from_secs(3600),
            idle_grace: Duration::from_secs(3600),
            reclaim_poll: Duration::from_millis(100),
            kill_poll: Duration::from_millis(200),
        }
    }

    async fn new_manager(
        config: ManagerConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> (Arc<WorkerBridgeServer>, WorkerManager) {
        let (bridge, channels) = WorkerBridgeServer::start(None).await.expect("bridge");
        let manager = WorkerManager::new(config, Arc::clone(&bridge), channels.signals, launcher)
            .await
            .expect("manager");
        (bridge, manager)
    }

    fn workflow_request(name: &str) -> WorkRequest {
        WorkRequest::Workflow(WorkflowRequest {
            workflow_id: Uuid::new_v4(),
            name: name.to_string(),
            targets: Vec::new(),
            args: ArgsPayload::default(),
            shared: Map::new(),
            config: RunConfig::default(),
        })
    }

    fn step_request(name: &str) -> WorkRequest {
        WorkRequest::Step(StepRequest {
            section: SectionRef {
                workflow: "wf".to_string(),
                name: name.to_string(),
                index: 0,
            },
            context: Map::new(),
            shared: Map::new(),
            args: ArgsPayload::default(),
            config: RunConfig::default(),
            verbosity: 2,
        })
    }

    fn substep_batch(id: &str) -> WorkRequest {
        WorkRequest::Substeps(SubstepBatch::single(
            id,
            SubstepUnit {
                task: "hash".to_string(),
                params: Map::new(),
            },
        ))
    }

    /// Connect a scripted client and return it with its root port.
    async fn scripted_client(bridge: &Arc<WorkerBridgeServer>) -> (BridgeClient, ReservationPort) {
        let worker_id = bridge.allocate_worker_id();
        let client = BridgeClient::connect(bridge.addr(), worker_id)
            .await
            .expect("connect");
        (client, ReservationPort::derive(worker_id, 0))
    }

    #[tokio::test]
    async fn pending_request_per_port_is_replaced_not_queued() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        let (mut client, port) = scripted_client(&bridge).await;

        manager
            .add_request(Some(port), workflow_request("first"))
            .await
            .expect("add first");
        manager
            .add_request(Some(port), workflow_request("second"))
            .await
            .expect("add second");
        assert_eq!(manager.status().pending_steps, 1);
        assert_eq!(manager.status().requested, 2);

        let round = tokio::spawn(async move {
            let first = client.request_work(port).await.expect("first round");
            let second = client.request_work(port).await.expect("second round");
            (first, second)
        });

        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        assert_eq!(signaled, Some(port));
        manager.process_request(port).await.expect("process 1");

        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        assert_eq!(signaled, Some(port));
        manager.process_request(port).await.expect("process 2");

        let (first, second) = round.await.expect("join");
        match first {
            ControlReply::Work(WorkRequest::Workflow(wf)) => assert_eq!(wf.name, "second"),
            other => panic!("expected replaced workflow, got {other:?}"),
        }
        // before any re-claim, the same port gets an empty payload
        assert_eq!(second, ControlReply::Idle);
        assert_eq!(manager.status().processed, 1);
        assert_eq!(manager.status().available_ports, 1);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn substeps_drain_newest_first() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        let (mut client, port) = scripted_client(&bridge).await;

        for id in ["s1", "s2", "s3"] {
            manager
                .add_request(None, substep_batch(id))
                .await
                .expect("queue substep");
        }
        assert_eq!(manager.status().queued_substeps, 3);

        let rounds = tokio::spawn(async move {
            let mut replies = Vec::new();
            for _ in 0..4 {
                replies.push(client.request_work(port).await.expect("round"));
            }
            replies
        });

        for _ in 0..4 {
            let signaled = manager.poll_signal(Duration::from_secs(1)).await;
            assert_eq!(signaled, Some(port));
            manager.process_request(port).await.expect("process");
        }

        let replies = rounds.await.expect("join");
        let mut delivered = Vec::new();
        for reply in &replies[..3] {
            match reply {
                ControlReply::Work(WorkRequest::Substeps(batch)) => {
                    delivered.push(batch.units.keys().next().expect("unit").clone());
                }
                other => panic!("expected substeps, got {other:?}"),
            }
        }
        assert_eq!(delivered, vec!["s3", "s2", "s1"]);
        // after exhaustion the port is parked as available with an empty reply
        assert_eq!(replies[3], ControlReply::Idle);
        assert_eq!(manager.status().available_ports, 1);
        assert_eq!(manager.status().processed, 3);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn claimed_port_idles_until_its_request_arrives() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        let (mut client, port) = scripted_client(&bridge).await;

        // park the port as available
        let round = tokio::spawn(async move { client.request_work(port).await.expect("round") });
        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        assert_eq!(signaled, Some(port));
        manager.process_request(port).await.expect("park");
        assert_eq!(round.await.expect("join"), ControlReply::Idle);

        // claim it
        let claimed = manager.worker_available().await.expect("claim");
        assert_eq!(claimed, Some(port));
        assert_eq!(manager.status().claimed_ports, 1);
        assert_eq!(manager.status().available_ports, 0);

        // even with substeps queued, a claimed port is held for its request
        manager
            .add_request(None, substep_batch("s"))
            .await
            .expect("queue substep");
        let (mut client, _) = reconnect(&bridge, port).await;
        let round = tokio::spawn(async move { client.request_work(port).await.expect("round") });
        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        assert_eq!(signaled, Some(port));
        manager.process_request(port).await.expect("hold claimed");
        assert_eq!(round.await.expect("join"), ControlReply::Idle);

        // once the request lands it is delivered and the claim released
        manager
            .add_request(Some(port), step_request("collect"))
            .await
            .expect("add step");
        let (mut client, _) = reconnect(&bridge, port).await;
        let round = tokio::spawn(async move { client.request_work(port).await.expect("round") });
        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        assert_eq!(signaled, Some(port));
        manager.process_request(port).await.expect("deliver");
        match round.await.expect("join") {
            ControlReply::Work(WorkRequest::Step(step)) => {
                assert_eq!(step.section.name, "collect")
            }
            other => panic!("expected step, got {other:?}"),
        }
        assert_eq!(manager.status().claimed_ports, 0);

        bridge.shutdown().await;
    }

    /// Reconnect a scripted client that will signal on an existing port.
    async fn reconnect(
        bridge: &Arc<WorkerBridgeServer>,
        port: ReservationPort,
    ) -> (BridgeClient, ReservationPort) {
        let client = BridgeClient::connect(bridge.addr(), port.worker_id())
            .await
            .expect("connect");
        (client, port)
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_workers() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        assert_eq!(manager.status().live_workers, 1);

        // no available ports: each call may spawn, but only up to the cap
        for _ in 0..5 {
            let claimed = manager.worker_available().await.expect("call");
            assert!(claimed.is_none());
            assert!(manager.status().live_workers <= 2);
        }
        assert_eq!(manager.status().live_workers, 2);
        assert!(manager.youngest_worker_age().is_some());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn liveness_sweep_raises_on_vanished_worker() {
        let mut config = test_config();
        config.liveness_interval = Duration::from_millis(20);
        let (bridge, mut manager) = new_manager(config, Arc::new(DyingLauncher)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = manager.check_workers().await;
        assert!(matches!(
            result,
            Err(PoolError::WorkerKilled {
                expected: 1,
                alive: 0
            })
        ));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn reclamation_never_drops_below_one_worker() {
        let mut config = test_config();
        config.idle_grace = Duration::ZERO;
        let (bridge, mut manager) = new_manager(config, Arc::new(IdleLauncher)).await;

        // grow to two workers
        let claimed = manager.worker_available().await.expect("grow");
        assert!(claimed.is_none());
        assert_eq!(manager.status().live_workers, 2);

        // two idle scripted workers, both signaling readiness
        let (mut client_a, port_a) = scripted_client(&bridge).await;
        let (mut client_b, port_b) = scripted_client(&bridge).await;
        let round_a = tokio::spawn(async move { client_a.request_work(port_a).await });
        let round_b = tokio::spawn(async move { client_b.request_work(port_b).await });

        // reclamation retires exactly one of them and stops at the floor
        manager.check_workers().await.expect("reclaim");
        assert_eq!(manager.status().live_workers, 1);

        // the survivor's pending signal is answered normally
        let signaled = manager.poll_signal(Duration::from_secs(1)).await;
        let port = signaled.expect("survivor signal");
        manager.process_request(port).await.expect("park survivor");

        let replies = [round_a.await.expect("join a"), round_b.await.expect("join b")];
        let shutdowns = replies
            .iter()
            .filter(|reply| matches!(reply, Ok(ControlReply::Shutdown)))
            .count();
        let idles = replies
            .iter()
            .filter(|reply| matches!(reply, Ok(ControlReply::Idle)))
            .count();
        assert_eq!(shutdowns, 1);
        assert_eq!(idles, 1);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn kill_all_answers_signals_with_shutdown() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        let claimed = manager.worker_available().await.expect("grow");
        assert!(claimed.is_none());
        assert_eq!(manager.status().live_workers, 2);

        let (mut client_a, port_a) = scripted_client(&bridge).await;
        let (mut client_b, port_b) = scripted_client(&bridge).await;
        let round_a = tokio::spawn(async move { client_a.request_work(port_a).await });
        let round_b = tokio::spawn(async move { client_b.request_work(port_b).await });

        manager.kill_all().await;
        assert_eq!(manager.status().live_workers, 0);

        assert_eq!(round_a.await.expect("join a").expect("a"), ControlReply::Shutdown);
        assert_eq!(round_b.await.expect("join b").expect("b"), ControlReply::Shutdown);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn unported_step_is_rejected() {
        let (bridge, mut manager) = new_manager(test_config(), Arc::new(IdleLauncher)).await;
        let result = manager.add_request(None, step_request("s")).await;
        assert!(matches!(result, Err(PoolError::InvalidRequest(_))));

        let result = manager
            .add_request(Some(ReservationPort::derive(9, 0)), substep_batch("x"))
            .await;
        assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
        bridge.shutdown().await;
    }
}
