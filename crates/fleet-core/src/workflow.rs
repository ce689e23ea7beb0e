use crate::{FleetResult, RunContext, Task, WorkflowEvent};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Ordered stream of wire events for one run.
pub type EventStream = Pin<Box<dyn Stream<Item = WorkflowEvent> + Send>>;

/// Anything that can execute a task and stream its progress.
///
/// The returned stream always ends with exactly one terminal event
/// (`response.completed` or `error`). Transport framing such as the SSE
/// `[DONE]` sentinel is added by the transport, not by the stream.
#[async_trait]
pub trait RunsWorkflow: Send + Sync {
    /// Start `task` under `ctx` and return its event stream.
    async fn run(&self, task: Task, ctx: RunContext) -> FleetResult<EventStream>;
}
