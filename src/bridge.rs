//! TCP bridge between the manager and its worker pool.
//!
//! The [`WorkerBridgeServer`] owns the listening side of the control channel.
//! The protocol works as follows:
//!
//! 1. The manager reserves a worker id and spawns a worker process
//! 2. The worker connects and sends a `Hello` frame with its id
//! 3. Readiness signals from every worker are funneled into one channel for
//!    the manager; executor updates into another for the owning loop
//! 4. Replies are routed back by reservation port: each `Ready { port }`
//!    frame records which connection is currently blocked on that port
//!
//! Workers use the [`BridgeClient`] side: a strict request/response
//! round-trip for work, plus fire-and-forget executor updates.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result as AnyResult};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::messages::{
    ControlReply, ExecutorUpdate, MessageError, ReservationPort, WorkerFrame, read_frame,
    write_frame,
};

/// Channel buffer for the readiness-signal funnel.
const SIGNAL_BUFFER: usize = 256;

/// Channel buffer for per-connection replies. Workers hold at most one
/// outstanding request per connection, so this never fills in practice.
const REPLY_BUFFER: usize = 8;

/// A worker readiness signal as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadySignal {
    pub worker_id: u64,
    pub port: ReservationPort,
}

/// An executor message as seen by the owning loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerUpdate {
    pub worker_id: u64,
    pub port: ReservationPort,
    pub update: ExecutorUpdate,
}

/// Receiving ends handed to the bridge owner at startup.
pub struct BridgeChannels {
    /// Readiness signals, consumed by the manager
    pub signals: mpsc::Receiver<ReadySignal>,
    /// Executor updates, consumed by the owning scheduling loop
    pub updates: mpsc::Receiver<WorkerUpdate>,
}

struct BridgeShared {
    routes: Mutex<HashMap<ReservationPort, mpsc::Sender<ControlReply>>>,
}

/// Listening side of the control channel.
pub struct WorkerBridgeServer {
    addr: SocketAddr,
    shared: Arc<BridgeShared>,
    next_worker_id: AtomicU64,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerBridgeServer {
    /// Start the bridge.
    ///
    /// If `bind_addr` is `None`, binds to localhost on an ephemeral port; the
    /// bound address is available from [`Self::addr`].
    pub async fn start(
        bind_addr: Option<SocketAddr>,
    ) -> AnyResult<(Arc<Self>, BridgeChannels)> {
        let bind_addr =
            bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let listener = TcpListener::bind(bind_addr)
            .await
            .context("failed to bind worker bridge listener")?;
        let addr = listener
            .local_addr()
            .context("failed to resolve bridge addr")?;

        info!(%addr, "worker bridge starting");

        let (signal_tx, signals) = mpsc::channel(SIGNAL_BUFFER);
        let (update_tx, updates) = mpsc::channel(SIGNAL_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let shared = Arc::new(BridgeShared {
            routes: Mutex::new(HashMap::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("bridge accept loop shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "worker connection accepted");
                            let conn_shared = Arc::clone(&accept_shared);
                            let signal_tx = signal_tx.clone();
                            let update_tx = update_tx.clone();
                            tokio::spawn(async move {
                                run_connection(conn_shared, stream, signal_tx, update_tx).await;
                            });
                        }
                        Err(err) => {
                            warn!(?err, "bridge accept failed");
                        }
                    }
                }
            }
        });

        let server = Arc::new(Self {
            addr,
            shared,
            next_worker_id: AtomicU64::new(0),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            accept_handle: Mutex::new(Some(accept_handle)),
        });

        Ok((server, BridgeChannels { signals, updates }))
    }

    /// The address the bridge is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Reserve a worker id for a process about to be spawned.
    pub fn allocate_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a reply to the worker currently blocked on `port`.
    pub async fn reply(
        &self,
        port: ReservationPort,
        reply: ControlReply,
    ) -> Result<(), MessageError> {
        let sender = {
            let routes = self.shared.routes.lock().await;
            routes.get(&port).cloned()
        };
        let sender = sender.ok_or(MessageError::UnknownPort(port))?;
        sender
            .send(reply)
            .await
            .map_err(|_| MessageError::ChannelClosed)
    }

    /// Stop accepting connections. Existing worker connections stay open
    /// until their workers disconnect.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.accept_handle.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(?err, "bridge accept task join failed");
            }
        }
    }
}

async fn run_connection(
    shared: Arc<BridgeShared>,
    stream: TcpStream,
    signal_tx: mpsc::Sender<ReadySignal>,
    update_tx: mpsc::Sender<WorkerUpdate>,
) {
    let (mut reader, writer) = stream.into_split();

    let worker_id = match read_frame::<_, WorkerFrame>(&mut reader).await {
        Ok(WorkerFrame::Hello { worker_id }) => worker_id,
        Ok(other) => {
            warn!(?other, "expected hello as first frame, dropping connection");
            return;
        }
        Err(err) => {
            warn!(?err, "worker handshake failed");
            return;
        }
    };
    info!(worker_id, "worker connected");

    let (reply_tx, reply_rx) = mpsc::channel::<ControlReply>(REPLY_BUFFER);
    let writer_handle = tokio::spawn(write_replies(writer, reply_rx, worker_id));

    let mut owned_ports: Vec<ReservationPort> = Vec::new();
    loop {
        match read_frame::<_, WorkerFrame>(&mut reader).await {
            Ok(WorkerFrame::Ready { port }) => {
                {
                    let mut routes = shared.routes.lock().await;
                    routes.insert(port, reply_tx.clone());
                }
                if !owned_ports.contains(&port) {
                    owned_ports.push(port);
                }
                if signal_tx
                    .send(ReadySignal { worker_id, port })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(WorkerFrame::Update { port, update }) => {
                // best-effort: an owner that stopped listening for updates
                // must not take the worker's control channel down with it
                let forwarded = update_tx
                    .send(WorkerUpdate {
                        worker_id,
                        port,
                        update,
                    })
                    .await;
                if forwarded.is_err() {
                    debug!(worker_id, %port, "dropping update, no listener");
                }
            }
            Ok(WorkerFrame::Hello { .. }) => {
                warn!(worker_id, "unexpected duplicate hello, ignoring");
            }
            Err(MessageError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(worker_id, "worker disconnected");
                break;
            }
            Err(err) => {
                warn!(?err, worker_id, "worker stream error, dropping connection");
                break;
            }
        }
    }

    {
        // a port may have migrated to a newer connection for the same
        // worker; only remove routes that still point here
        let mut routes = shared.routes.lock().await;
        for port in owned_ports {
            let stale = routes
                .get(&port)
                .is_some_and(|sender| sender.same_channel(&reply_tx));
            if stale {
                routes.remove(&port);
            }
        }
    }
    writer_handle.abort();
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut reply_rx: mpsc::Receiver<ControlReply>,
    worker_id: u64,
) {
    while let Some(reply) = reply_rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &reply).await {
            warn!(?err, worker_id, "reply write failed");
            break;
        }
    }
}

/// Worker-side endpoint of the control channel. Owned exclusively by one
/// worker; all I/O is sequential.
pub struct BridgeClient {
    stream: TcpStream,
    worker_id: u64,
}

impl BridgeClient {
    /// Connect to the bridge and perform the hello handshake.
    pub async fn connect(addr: SocketAddr, worker_id: u64) -> Result<Self, MessageError> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &WorkerFrame::Hello { worker_id }).await?;
        Ok(Self { stream, worker_id })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Signal readiness on `port` and block until the manager replies.
    pub async fn request_work(
        &mut self,
        port: ReservationPort,
    ) -> Result<ControlReply, MessageError> {
        write_frame(&mut self.stream, &WorkerFrame::Ready { port }).await?;
        read_frame(&mut self.stream).await
    }

    /// Forward an executor update to the owning loop. No reply is expected.
    pub async fn send_update(
        &mut self,
        port: ReservationPort,
        update: ExecutorUpdate,
    ) -> Result<(), MessageError> {
        write_frame(&mut self.stream, &WorkerFrame::Update { port, update }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn bridge_binds_ephemeral_port() {
        let (bridge, _channels) = WorkerBridgeServer::start(None).await.expect("start");
        assert!(bridge.addr().port() > 0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn worker_ids_increment() {
        let (bridge, _channels) = WorkerBridgeServer::start(None).await.expect("start");
        assert_eq!(bridge.allocate_worker_id(), 0);
        assert_eq!(bridge.allocate_worker_id(), 1);
        assert_eq!(bridge.allocate_worker_id(), 2);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn ready_signal_routes_reply_back() {
        let (bridge, mut channels) = WorkerBridgeServer::start(None).await.expect("start");
        let worker_id = bridge.allocate_worker_id();
        let mut client = BridgeClient::connect(bridge.addr(), worker_id)
            .await
            .expect("connect");

        let port = ReservationPort::derive(worker_id, 0);
        let request = tokio::spawn(async move { client.request_work(port).await });

        let signal = timeout(Duration::from_secs(1), channels.signals.recv())
            .await
            .expect("signal in time")
            .expect("signal");
        assert_eq!(signal.port, port);
        assert_eq!(signal.worker_id, worker_id);

        bridge.reply(port, ControlReply::Idle).await.expect("reply");
        let reply = timeout(Duration::from_secs(1), request)
            .await
            .expect("reply in time")
            .expect("join")
            .expect("request");
        assert_eq!(reply, ControlReply::Idle);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn reply_to_unknown_port_is_an_error() {
        let (bridge, _channels) = WorkerBridgeServer::start(None).await.expect("start");
        let result = bridge
            .reply(ReservationPort::derive(9, 0), ControlReply::Idle)
            .await;
        assert!(matches!(result, Err(MessageError::UnknownPort(_))));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn updates_are_funneled_to_owner() {
        let (bridge, mut channels) = WorkerBridgeServer::start(None).await.expect("start");
        let worker_id = bridge.allocate_worker_id();
        let mut client = BridgeClient::connect(bridge.addr(), worker_id)
            .await
            .expect("connect");

        let port = ReservationPort::derive(worker_id, 0);
        client
            .send_update(
                port,
                ExecutorUpdate::Failed {
                    message: "boom".to_string(),
                },
            )
            .await
            .expect("send update");

        let update = timeout(Duration::from_secs(1), channels.updates.recv())
            .await
            .expect("update in time")
            .expect("update");
        assert_eq!(update.worker_id, worker_id);
        assert!(update.update.is_failure());

        bridge.shutdown().await;
    }
}
