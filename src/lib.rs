//! Worker-pool coordination for a polyglot workflow engine.
//!
//! A manager dispatches steps, nested workflows, and substep batches to a
//! bounded pool of worker processes over a TCP control channel, tracks
//! liveness, reclaims idle workers, and lets a single worker interleave an
//! outer suspended job with inner work through a resumable-execution
//! protocol.

pub mod bridge;
pub mod config;
pub mod executor;
pub mod launcher;
pub mod manager;
pub mod messages;
pub mod observability;
pub mod signatures;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use bridge::{BridgeChannels, BridgeClient, ReadySignal, WorkerBridgeServer, WorkerUpdate};
pub use config::{Config, RunConfig, RunMode, SigMode};
pub use executor::{
    ExecContext, ExecError, ExecSignal, PollableEvent, Resumable, ResumeValue, SuspendHandle,
    WorkExecutor,
};
pub use launcher::{InlineLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use manager::{ManagerConfig, PoolError, WorkerManager};
pub use messages::{
    ArgsPayload, ControlReply, ExecutorUpdate, MessageError, ReservationPort, SectionRef,
    StepRequest, SubstepBatch, SubstepUnit, WorkRequest, WorkerFrame, WorkflowRequest,
};
pub use signatures::{
    MemorySignatureStore, SignatureChannels, SignatureClient, SignatureError, SignaturePush,
    SignatureRequest, SignatureResponse, SignatureStore, WorkflowEntry, signature_channel,
    spawn_signature_service,
};
pub use status::{PoolStatus, PoolTimeSeries, TimeSeriesEntry, TimeSeriesJsonEntry};
pub use supervisor::{PoolHandle, Supervisor, SupervisorConfig};
pub use worker::{Worker, WorkerError, WorkerOptions, run_worker};
