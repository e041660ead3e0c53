//! Interface to the signature bookkeeping service.
//!
//! Signatures (workflow records, target hashes, step hashes) are maintained
//! by an independent background task with two channels: a push channel for
//! fire-and-forget writes and a request channel for synchronous reads
//! answered over a oneshot. The durable store itself lives outside this
//! crate; [`MemorySignatureStore`] backs tests and single-process runs.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature service unavailable")]
    ServiceClosed,
}

/// A per-workflow bookkeeping entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEntry {
    /// A placeholder target created while the workflow runs
    Placeholder(String),
    /// An arbitrary keyed record
    Record { key: String, value: Value },
}

/// Fire-and-forget signature writes.
#[derive(Debug, Clone, PartialEq)]
pub enum SignaturePush {
    Workflow {
        workflow_id: Uuid,
        entry: WorkflowEntry,
    },
    Target {
        target: String,
        signature: Value,
    },
    Step {
        step_id: String,
        signature: Value,
    },
}

/// Synchronous signature reads.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureRequest {
    WorkflowClear,
    WorkflowPlaceholders { workflow_id: Uuid },
    TargetGet { target: String },
    StepGet { step_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignatureResponse {
    Ack,
    Placeholders(Vec<String>),
    Signature(Option<Value>),
}

type SignatureQuery = (SignatureRequest, oneshot::Sender<SignatureResponse>);

/// Client half of the signature channels. Cheap to clone; one per component
/// that records or checks signatures.
#[derive(Clone)]
pub struct SignatureClient {
    push_tx: mpsc::UnboundedSender<SignaturePush>,
    request_tx: mpsc::Sender<SignatureQuery>,
}

impl SignatureClient {
    /// Record a signature without waiting for the service.
    pub fn push(&self, record: SignaturePush) -> Result<(), SignatureError> {
        self.push_tx
            .send(record)
            .map_err(|_| SignatureError::ServiceClosed)
    }

    /// Ask the service and wait for its answer.
    pub async fn request(
        &self,
        request: SignatureRequest,
    ) -> Result<SignatureResponse, SignatureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((request, reply_tx))
            .await
            .map_err(|_| SignatureError::ServiceClosed)?;
        reply_rx.await.map_err(|_| SignatureError::ServiceClosed)
    }

    pub async fn target_signature(&self, target: &str) -> Result<Option<Value>, SignatureError> {
        match self
            .request(SignatureRequest::TargetGet {
                target: target.to_string(),
            })
            .await?
        {
            SignatureResponse::Signature(signature) => Ok(signature),
            _ => Ok(None),
        }
    }

    pub async fn step_signature(&self, step_id: &str) -> Result<Option<Value>, SignatureError> {
        match self
            .request(SignatureRequest::StepGet {
                step_id: step_id.to_string(),
            })
            .await?
        {
            SignatureResponse::Signature(signature) => Ok(signature),
            _ => Ok(None),
        }
    }

    pub async fn workflow_placeholders(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<String>, SignatureError> {
        match self
            .request(SignatureRequest::WorkflowPlaceholders { workflow_id })
            .await?
        {
            SignatureResponse::Placeholders(placeholders) => Ok(placeholders),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn clear_workflows(&self) -> Result<(), SignatureError> {
        self.request(SignatureRequest::WorkflowClear).await?;
        Ok(())
    }
}

/// Receiving halves handed to the service task.
pub struct SignatureChannels {
    pub push_rx: mpsc::UnboundedReceiver<SignaturePush>,
    pub request_rx: mpsc::Receiver<SignatureQuery>,
}

/// Create the client/service channel pair.
pub fn signature_channel(request_buffer: usize) -> (SignatureClient, SignatureChannels) {
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::channel(request_buffer.max(1));
    (
        SignatureClient {
            push_tx,
            request_tx,
        },
        SignatureChannels {
            push_rx,
            request_rx,
        },
    )
}

/// Storage behind the signature service.
pub trait SignatureStore: Send {
    fn apply(&mut self, push: SignaturePush);
    fn query(&mut self, request: &SignatureRequest) -> SignatureResponse;
}

/// In-memory signature store.
#[derive(Debug, Default)]
pub struct MemorySignatureStore {
    workflows: HashMap<Uuid, Vec<WorkflowEntry>>,
    targets: HashMap<String, Value>,
    steps: HashMap<String, Value>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_entries(&self, workflow_id: Uuid) -> &[WorkflowEntry] {
        self.workflows
            .get(&workflow_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl SignatureStore for MemorySignatureStore {
    fn apply(&mut self, push: SignaturePush) {
        match push {
            SignaturePush::Workflow { workflow_id, entry } => {
                self.workflows.entry(workflow_id).or_default().push(entry);
            }
            SignaturePush::Target { target, signature } => {
                self.targets.insert(target, signature);
            }
            SignaturePush::Step { step_id, signature } => {
                self.steps.insert(step_id, signature);
            }
        }
    }

    fn query(&mut self, request: &SignatureRequest) -> SignatureResponse {
        match request {
            SignatureRequest::WorkflowClear => {
                self.workflows.clear();
                SignatureResponse::Ack
            }
            SignatureRequest::WorkflowPlaceholders { workflow_id } => {
                let placeholders = self
                    .workflows
                    .get(workflow_id)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| match entry {
                                WorkflowEntry::Placeholder(target) => Some(target.clone()),
                                WorkflowEntry::Record { .. } => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                SignatureResponse::Placeholders(placeholders)
            }
            SignatureRequest::TargetGet { target } => {
                SignatureResponse::Signature(self.targets.get(target).cloned())
            }
            SignatureRequest::StepGet { step_id } => {
                SignatureResponse::Signature(self.steps.get(step_id).cloned())
            }
        }
    }
}

/// Run the signature bookkeeping service until both channels close or the
/// shutdown watch fires. Returns the store for inspection.
pub fn spawn_signature_service<S>(
    mut store: S,
    mut channels: SignatureChannels,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<S>
where
    S: SignatureStore + 'static,
{
    tokio::spawn(async move {
        info!("signature service starting");
        loop {
            // drain pending writes before answering any read, so a reader
            // always observes its own earlier writes
            tokio::select! {
                biased;
                push = channels.push_rx.recv() => match push {
                    Some(push) => store.apply(push),
                    None => break,
                },
                query = channels.request_rx.recv() => match query {
                    Some((request, reply_tx)) => {
                        let response = store.query(&request);
                        if reply_tx.send(response).is_err() {
                            debug!("signature requester went away");
                        }
                    }
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("signature service stopped");
        store
    })
}
