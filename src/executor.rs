//! Resumable execution protocol and the executor seam.
//!
//! A step or workflow runs as a [`Resumable`] computation: each call to
//! [`Resumable::resume`] either completes, yields control momentarily, or
//! suspends on a pollable [`SuspendHandle`]. The worker's driving loop polls
//! the handle with a short timeout and, while the awaited event is not ready,
//! services other work addressed to the same worker at a deeper nesting
//! level. Execution state lives in an explicit [`ExecContext`] per nesting
//! depth, never in process-global state.

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    config::RunConfig,
    messages::{ArgsPayload, StepRequest, SubstepUnit, WorkflowRequest},
};

/// Engine version exposed to executing steps.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value delivered to a computation when its awaited event fires.
pub type ResumeValue = Value;

/// Failure of a delegated computation. Caught at the worker boundary and
/// forwarded to the requester; never crashes the worker.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    Failed(String),
    #[error("suspend event source closed before a value arrived")]
    EventClosed,
}

impl ExecError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Outcome of one resume call on a computation.
pub enum ExecSignal {
    /// Blocked on an external event; poll the handle.
    Pending(SuspendHandle),
    /// Not blocked; resume again immediately with no value.
    Yield,
    /// The computation finished.
    Complete,
}

/// An event source that can be asked, repeatedly and with a timeout, whether
/// the awaited result has arrived.
pub trait PollableEvent: Send {
    /// Wait for the event value. `None` means the source is gone and the
    /// computation can never be resumed.
    fn wait(&mut self) -> BoxFuture<'_, Option<ResumeValue>>;
}

/// A pollable suspend point handed out by a computation.
pub struct SuspendHandle {
    event: Box<dyn PollableEvent>,
}

impl SuspendHandle {
    pub fn new(event: Box<dyn PollableEvent>) -> Self {
        Self { event }
    }

    /// Suspend on a channel; the computation resumes with the next value
    /// received on it.
    pub fn from_channel(rx: mpsc::Receiver<ResumeValue>) -> Self {
        Self::new(Box::new(ChannelEvent { rx }))
    }

    /// An already-fired event. Yields its value exactly once.
    pub fn ready(value: ResumeValue) -> Self {
        Self::new(Box::new(ReadyEvent { value: Some(value) }))
    }

    pub async fn wait(&mut self) -> Option<ResumeValue> {
        self.event.wait().await
    }
}

struct ChannelEvent {
    rx: mpsc::Receiver<ResumeValue>,
}

impl PollableEvent for ChannelEvent {
    fn wait(&mut self) -> BoxFuture<'_, Option<ResumeValue>> {
        Box::pin(self.rx.recv())
    }
}

struct ReadyEvent {
    value: Option<ResumeValue>,
}

impl PollableEvent for ReadyEvent {
    fn wait(&mut self) -> BoxFuture<'_, Option<ResumeValue>> {
        let value = self.value.take();
        Box::pin(async move { value })
    }
}

/// A resumable step/workflow computation.
///
/// The first call is made with `None` and starts the computation; each
/// subsequent call passes the value produced by the suspend point the
/// computation last blocked on (or `None` after a [`ExecSignal::Yield`]).
pub trait Resumable: Send {
    fn resume(&mut self, input: Option<ResumeValue>)
    -> BoxFuture<'_, Result<ExecSignal, ExecError>>;
}

/// Execution context for one nesting depth: variable bindings plus the run
/// configuration in force. Passed explicitly to executors; one instance per
/// depth lives on the worker's context stack.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub vars: Map<String, Value>,
    pub args: ArgsPayload,
    pub config: RunConfig,
}

impl ExecContext {
    pub fn new(args: ArgsPayload, config: RunConfig) -> Self {
        let mut ctx = Self {
            vars: Map::new(),
            args,
            config,
        };
        ctx.reset();
        ctx
    }

    /// Reinitialize the bindings: engine version, raw arguments, the step
    /// output placeholder, and, for named (nested-workflow) arguments, the
    /// parameters themselves, minus dunder keys.
    pub fn reset(&mut self) {
        self.vars.clear();
        self.vars
            .insert("ENGINE_VERSION".to_string(), json!(ENGINE_VERSION));
        let args = serde_json::to_value(&self.args).unwrap_or(Value::Null);
        self.vars.insert("__args__".to_string(), args);
        self.vars
            .insert("__step_output__".to_string(), Value::Null);
        if let ArgsPayload::Named(params) = &self.args {
            for (key, value) in params {
                if !key.starts_with("__") {
                    self.vars.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Merge a state map into the bindings, overwriting existing keys.
    pub fn merge(&mut self, state: &Map<String, Value>) {
        for (key, value) in state {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Context for an incoming step request. Shared state is applied first so
    /// the step's own context bindings win where both define a key.
    pub fn for_step(request: &StepRequest) -> Self {
        let mut ctx = Self::new(request.args.clone(), request.config.clone());
        ctx.config.verbosity = request.verbosity;
        ctx.merge(&request.shared);
        ctx.merge(&request.context);
        ctx
    }

    /// Context for an incoming (possibly nested) workflow request.
    pub fn for_workflow(request: &WorkflowRequest) -> Self {
        let mut ctx = Self::new(request.args.clone(), request.config.clone());
        ctx.merge(&request.shared);
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }
}

/// The language-specific execution engine consumed by workers. Implementors
/// provide the actual step/workflow semantics; this crate only schedules
/// them.
pub trait WorkExecutor: Send + Sync {
    /// Build the resumable computation for a step.
    fn step(
        &self,
        request: StepRequest,
        ctx: &mut ExecContext,
    ) -> Result<Box<dyn Resumable>, ExecError>;

    /// Build the resumable computation for a nested workflow.
    fn workflow(
        &self,
        request: WorkflowRequest,
        ctx: &mut ExecContext,
    ) -> Result<Box<dyn Resumable>, ExecError>;

    /// Execute one substep unit synchronously in place.
    fn substep<'a>(
        &'a self,
        substep_id: &'a str,
        unit: &'a SubstepUnit,
        ctx: &'a ExecContext,
    ) -> BoxFuture<'a, Result<(), ExecError>>;

    /// Invoked once when the worker exits, before its sockets close. The
    /// default does nothing.
    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SectionRef;

    #[test]
    fn context_seeds_named_args() {
        let mut params = Map::new();
        params.insert("sample".to_string(), json!("a.fq"));
        params.insert("__hidden__".to_string(), json!(1));
        let ctx = ExecContext::new(ArgsPayload::Named(params), RunConfig::default());

        assert_eq!(ctx.get("sample"), Some(&json!("a.fq")));
        assert!(ctx.get("__hidden__").is_none());
        assert_eq!(ctx.get("ENGINE_VERSION"), Some(&json!(ENGINE_VERSION)));
        assert_eq!(ctx.get("__step_output__"), Some(&Value::Null));
    }

    #[test]
    fn step_context_prefers_step_bindings_over_shared() {
        let mut shared = Map::new();
        shared.insert("depth".to_string(), json!(1));
        shared.insert("genome".to_string(), json!("hg38"));
        let mut context = Map::new();
        context.insert("depth".to_string(), json!(30));

        let request = StepRequest {
            section: SectionRef {
                workflow: "align".to_string(),
                name: "map_reads".to_string(),
                index: 0,
            },
            context,
            shared,
            args: ArgsPayload::default(),
            config: RunConfig::default(),
            verbosity: 1,
        };

        let ctx = ExecContext::for_step(&request);
        assert_eq!(ctx.get("depth"), Some(&json!(30)));
        assert_eq!(ctx.get("genome"), Some(&json!("hg38")));
        assert_eq!(ctx.config.verbosity, 1);
    }

    #[tokio::test]
    async fn ready_handle_fires_once() {
        let mut handle = SuspendHandle::ready(json!(7));
        assert_eq!(handle.wait().await, Some(json!(7)));
        assert_eq!(handle.wait().await, None);
    }

    #[tokio::test]
    async fn channel_handle_delivers_sent_value() {
        let (tx, rx) = mpsc::channel(1);
        let mut handle = SuspendHandle::from_channel(rx);
        tx.send(json!("done")).await.expect("send");
        assert_eq!(handle.wait().await, Some(json!("done")));
    }
}
