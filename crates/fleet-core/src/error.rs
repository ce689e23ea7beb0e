use thiserror::Error;

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

/// Top-level error type for the Fleet engine.
///
/// Rejected approvals are not represented here: they are a normal, modeled
/// outcome of the approval gate.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Bad or missing settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The agent graph failed irrecoverably after exhausting its budgets.
    #[error("Workflow execution error: {0}")]
    WorkflowExecution(String),

    /// A checkpoint, conversation, or other entity does not exist.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The session manager is already running its maximum number of workflows.
    #[error("Over capacity: {active} of {limit} workflows running")]
    OverCapacity { active: usize, limit: usize },

    /// An agent invocation failed.
    #[error("Agent error: {0}")]
    Agent(String),

    /// The approval handler failed to produce a decision.
    #[error("Approval error: {0}")]
    Approval(String),

    /// An outbound HTTP request failed (e.g. LLM API call).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Checkpoint persistence failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Conversation or history persistence failed.
    #[error("Session error: {0}")]
    Session(String),

    /// Serialization or parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem or stream I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// HTTP-equivalent status code for surfacing this error at an API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            FleetError::ResourceNotFound(_) => 404,
            FleetError::OverCapacity { .. } => 429,
            FleetError::Json(_) => 400,
            FleetError::Http(_) => 502,
            _ => 500,
        }
    }

    /// Stable machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Configuration(_) => "configuration_error",
            FleetError::WorkflowExecution(_) => "workflow_execution_error",
            FleetError::ResourceNotFound(_) => "not_found",
            FleetError::OverCapacity { .. } => "over_capacity",
            FleetError::Agent(_) => "agent_error",
            FleetError::Approval(_) => "approval_error",
            FleetError::Http(_) => "upstream_error",
            FleetError::Checkpoint(_) => "checkpoint_error",
            FleetError::Session(_) => "session_error",
            FleetError::Json(_) => "invalid_json",
            FleetError::Io(_) => "io_error",
        }
    }
}
