//! Wire protocol for the manager / worker control channel.
//!
//! Every message that crosses the boundary is a closed, serde-tagged enum:
//! an unrecognized tag fails decoding with a typed [`MessageError`] instead
//! of being logged and skipped. Frames are length-prefixed JSON.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::config::RunConfig;

/// Upper bound on a single frame. Requests carry variable maps and target
/// lists, not bulk data; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Errors on the control-channel protocol.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),
    #[error("channel closed")]
    ChannelClosed,
    #[error("no worker is listening on reservation port {0}")]
    UnknownPort(ReservationPort),
}

/// Opaque token identifying one worker's active communication endpoint at a
/// given nesting depth. Derived worker-side; the manager treats it as an
/// opaque value and only tracks its availability state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ReservationPort(pub u64);

impl ReservationPort {
    /// Derive the port token for a worker at a nesting depth.
    pub fn derive(worker_id: u64, depth: u32) -> Self {
        Self((worker_id << 16) | u64::from(depth))
    }

    pub fn worker_id(self) -> u64 {
        self.0 >> 16
    }

    pub fn depth(self) -> u32 {
        (self.0 & 0xffff) as u32
    }
}

impl fmt::Display for ReservationPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command-line-equivalent arguments for a workflow. A nested workflow
/// instead carries a named-parameter mapping bound directly into the
/// execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgsPayload {
    Positional(Vec<String>),
    Named(Map<String, Value>),
}

impl Default for ArgsPayload {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

/// Identity of a workflow section (step) inside its workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRef {
    pub workflow: String,
    pub name: String,
    pub index: u32,
}

impl fmt::Display for SectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.workflow, self.name)
    }
}

/// A single step dispatched to a reserved worker port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub section: SectionRef,
    /// Step-local context bindings, applied after `shared`
    pub context: Map<String, Value>,
    /// Shared state visible to the step
    pub shared: Map<String, Value>,
    pub args: ArgsPayload,
    pub config: RunConfig,
    pub verbosity: u8,
}

/// A (possibly nested) workflow dispatched to a reserved worker port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow_id: Uuid,
    pub name: String,
    /// Resolved targets the workflow must produce
    pub targets: Vec<String>,
    pub args: ArgsPayload,
    pub shared: Map<String, Value>,
    pub config: RunConfig,
}

/// One independently schedulable unit of work with no ordering dependency on
/// its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstepUnit {
    pub task: String,
    pub params: Map<String, Value>,
}

/// A batch of independent substep units, keyed by substep id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstepBatch {
    pub units: BTreeMap<String, SubstepUnit>,
}

impl SubstepBatch {
    pub fn single(substep_id: impl Into<String>, unit: SubstepUnit) -> Self {
        let mut units = BTreeMap::new();
        units.insert(substep_id.into(), unit);
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Work submitted to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkRequest {
    Step(StepRequest),
    Workflow(WorkflowRequest),
    Substeps(SubstepBatch),
}

/// Manager response to a worker readiness signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    /// Termination sentinel: exit the dispatch loop.
    Shutdown,
    /// Nothing for this port yet; back off briefly and ask again.
    Idle,
    Work(WorkRequest),
}

/// Fire-and-forget message from a worker's executor to the owning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum ExecutorUpdate {
    /// A delegated step/workflow computation failed; the worker survives.
    Failed { message: String },
    /// One substep unit finished, successfully or not.
    SubstepCompleted {
        substep_id: String,
        error: Option<String>,
    },
}

impl ExecutorUpdate {
    pub fn is_failure(&self) -> bool {
        match self {
            ExecutorUpdate::Failed { .. } => true,
            ExecutorUpdate::SubstepCompleted { error, .. } => error.is_some(),
        }
    }
}

/// Frames sent by a worker over its control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Connection handshake, first frame on the wire.
    Hello { worker_id: u64 },
    /// Readiness signal on the worker's currently-active port.
    Ready { port: ReservationPort },
    /// Executor message routed to the owning loop.
    Update {
        port: ReservationPort,
        update: ExecutorUpdate,
    },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(MessageError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, MessageError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MessageError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> WorkRequest {
        WorkRequest::Workflow(WorkflowRequest {
            workflow_id: Uuid::new_v4(),
            name: "align".to_string(),
            targets: vec!["out.bam".to_string()],
            args: ArgsPayload::default(),
            shared: Map::new(),
            config: RunConfig::default(),
        })
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let sent = ControlReply::Work(sample_workflow());
        write_frame(&mut client, &sent).await.expect("write");
        let received: ControlReply = read_frame(&mut server).await.expect("read");
        assert_eq!(sent, received);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len)
            .await
            .expect("write len");
        let result: Result<ControlReply, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(MessageError::FrameTooLarge(_))));
    }

    #[test]
    fn unknown_tag_is_a_typed_error() {
        let result: Result<ControlReply, _> =
            serde_json::from_value(json!({"reply": "explode"}));
        assert!(result.is_err());

        let result: Result<WorkerFrame, _> =
            serde_json::from_value(json!({"frame": "greeting", "worker_id": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn port_derivation_is_stable() {
        let port = ReservationPort::derive(3, 2);
        assert_eq!(port.worker_id(), 3);
        assert_eq!(port.depth(), 2);
        assert_ne!(port, ReservationPort::derive(3, 1));
        assert_ne!(port, ReservationPort::derive(2, 2));
    }

    #[test]
    fn args_payload_shapes() {
        let positional: ArgsPayload =
            serde_json::from_value(json!(["--sample", "a.fq"])).unwrap();
        assert!(matches!(positional, ArgsPayload::Positional(ref v) if v.len() == 2));

        let named: ArgsPayload = serde_json::from_value(json!({"sample": "a.fq"})).unwrap();
        assert!(matches!(named, ArgsPayload::Named(_)));
    }
}
