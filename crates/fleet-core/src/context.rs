use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Request-scoped execution context.
///
/// Passed explicitly through every call in a run's call graph so concurrent
/// runs sharing one engine never observe each other's scope.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    /// Identifies the run in logs, checkpoints and history.
    pub workflow_id: String,
    /// Conversation the run belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Caller-supplied id echoed on every wire event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Team scope selected for this run (set once routing has happened).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Tool/skill names the run is allowed to use.
    pub tools: Vec<String>,
    /// Cancelled when the caller goes away. Round boundaries check it; waits
    /// such as approvals select on it.
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl RunContext {
    /// Create a context with a fresh workflow id.
    pub fn new() -> Self {
        Self::with_workflow_id(format!("wf-{}", Uuid::new_v4()))
    }

    /// Create a context with a caller-chosen workflow id.
    pub fn with_workflow_id(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            conversation_id: None,
            correlation_id: None,
            team: None,
            tools: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Build a context for a task, inheriting its conversation and correlation ids.
    pub fn for_task(task: &crate::Task) -> Self {
        let mut ctx = Self::new();
        ctx.conversation_id = task.conversation_id.clone();
        ctx.correlation_id = task.correlation_id.clone();
        ctx
    }

    /// Return a copy scoped to a team and its tools.
    pub fn scoped_to(&self, team: impl Into<String>, tools: Vec<String>) -> Self {
        let mut scoped = self.clone();
        scoped.team = Some(team.into());
        scoped.tools = tools;
        scoped
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
