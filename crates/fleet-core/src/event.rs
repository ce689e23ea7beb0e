use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Literal payload of the line that terminates every wire stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// The stable wire taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Incremental reasoning text from an agent.
    ReasoningDelta,
    /// Full reasoning text once an agent stops thinking.
    ReasoningCompleted,
    /// Incremental answer text from an agent.
    MessageDelta,
    /// An agent finished its message.
    MessageDone,
    /// Plan, replan or progress notice from the orchestrator.
    OrchestratorMessage,
    /// Final answer. Terminal.
    ResponseCompleted,
    /// Run failed. Terminal.
    Error,
}

impl EventKind {
    /// Every kind, in wire order.
    pub const ALL: [EventKind; 7] = [
        EventKind::ReasoningDelta,
        EventKind::ReasoningCompleted,
        EventKind::MessageDelta,
        EventKind::MessageDone,
        EventKind::OrchestratorMessage,
        EventKind::ResponseCompleted,
        EventKind::Error,
    ];

    /// Wire name, e.g. `message.delta`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ReasoningDelta => "reasoning.delta",
            EventKind::ReasoningCompleted => "reasoning.completed",
            EventKind::MessageDelta => "message.delta",
            EventKind::MessageDone => "message.done",
            EventKind::OrchestratorMessage => "orchestrator.message",
            EventKind::ResponseCompleted => "response.completed",
            EventKind::Error => "error",
        }
    }

    /// Inverse of [`EventKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Terminal events end a request/response cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::ResponseCompleted | EventKind::Error)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of progress sent to a streaming client.
///
/// On the wire the payload is flattened next to `type`:
/// `{"type":"message.delta","delta":"...","agent_id":"worker"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Wire name of the [`EventKind`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub data: Map<String, Value>,
    /// Echo of the caller's correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WorkflowEvent {
    /// An event of `kind` carrying `data`.
    pub fn new(kind: EventKind, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
            correlation_id: None,
        }
    }

    /// Tag the event with a correlation id.
    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// `reasoning.delta` with `delta` and `agent_id`.
    pub fn reasoning_delta(agent_id: &str, delta: &str) -> Self {
        Self::new(
            EventKind::ReasoningDelta,
            object([("delta", delta.into()), ("agent_id", agent_id.into())]),
        )
    }

    /// `reasoning.completed` with the full `reasoning`.
    pub fn reasoning_completed(agent_id: &str, reasoning: &str) -> Self {
        Self::new(
            EventKind::ReasoningCompleted,
            object([("reasoning", reasoning.into()), ("agent_id", agent_id.into())]),
        )
    }

    /// `message.delta` with `delta` and `agent_id`.
    pub fn message_delta(agent_id: &str, delta: &str) -> Self {
        Self::new(
            EventKind::MessageDelta,
            object([("delta", delta.into()), ("agent_id", agent_id.into())]),
        )
    }

    /// `message.done` with the full `content`.
    pub fn message_done(agent_id: &str, content: &str) -> Self {
        Self::new(
            EventKind::MessageDone,
            object([("content", content.into()), ("agent_id", agent_id.into())]),
        )
    }

    /// `orchestrator.message` with `message` and `kind` (plan, replan, progress).
    pub fn orchestrator_message(message: &str, kind: &str) -> Self {
        Self::new(
            EventKind::OrchestratorMessage,
            object([("message", message.into()), ("kind", kind.into())]),
        )
    }

    /// `response.completed` carrying the answer, run metadata and conversation id.
    pub fn response_completed(
        content: &str,
        metadata: Map<String, Value>,
        conversation_id: Option<&str>,
    ) -> Self {
        let mut data = object([
            ("response", serde_json::json!({ "content": content })),
            ("metadata", Value::Object(metadata)),
        ]);
        if let Some(id) = conversation_id {
            data.insert("conversation_id".into(), id.into());
        }
        Self::new(EventKind::ResponseCompleted, data)
    }

    /// `error` with a message and the failing agent, if known.
    pub fn error(message: &str, agent_id: Option<&str>) -> Self {
        let mut data = object([("error", message.into())]);
        if let Some(agent) = agent_id {
            data.insert("agent_id".into(), agent.into());
        }
        Self::new(EventKind::Error, data)
    }

    /// Parsed kind, or `None` for unknown wire names.
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.kind)
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.event_kind().is_some_and(EventKind::is_terminal)
    }

    /// The `agent_id` field, when present.
    pub fn agent_id(&self) -> Option<&str> {
        self.data.get("agent_id").and_then(Value::as_str)
    }

    /// Single-line JSON used as the body of an SSE `data:` line.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}"}}"#, self.kind)
        })
    }
}

fn object<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
