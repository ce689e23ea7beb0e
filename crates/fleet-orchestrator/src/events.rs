use fleet_agent::{Agent, AgentInput, AgentOutput};
use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Kind of orchestrator notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// First plan of a run.
    Plan,
    /// Plan redone after a stall reset.
    Replan,
    /// Round progress update.
    Progress,
}

impl NoticeKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::Plan => "plan",
            NoticeKind::Replan => "replan",
            NoticeKind::Progress => "progress",
        }
    }
}

/// Everything the engine reports while a run is in flight, before it is
/// reshaped into wire events.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    /// An agent began an invocation.
    AgentStarted {
        /// Agent name.
        agent: String,
    },
    /// An agent finished an invocation.
    AgentIdle {
        /// Agent name.
        agent: String,
    },
    /// A reasoning fragment.
    ReasoningToken {
        /// Agent name.
        agent: String,
        /// New reasoning text.
        delta: String,
    },
    /// The agent's reasoning stream for the current invocation has ended.
    ReasoningDone {
        /// Agent name.
        agent: String,
    },
    /// An answer fragment.
    TextToken {
        /// Agent name.
        agent: String,
        /// New answer text.
        delta: String,
    },
    /// Complete output of one visible agent invocation.
    AgentMessage {
        /// Agent name.
        agent: String,
        /// Full output text.
        content: String,
    },
    /// Plan, replan or progress notice.
    Notice {
        /// Notice text.
        message: String,
        /// Which kind of notice.
        kind: NoticeKind,
    },
    /// The run produced its final answer.
    Completed {
        /// Final answer.
        content: String,
        /// Run metadata (pattern, trace, scores).
        metadata: Map<String, Value>,
        /// Conversation of the run, if any.
        conversation_id: Option<String>,
    },
    /// The run failed.
    Failed {
        /// Error text.
        message: String,
        /// Agent that failed, when known.
        agent: Option<String>,
    },
}

/// Tag of an [`InternalEvent`], the key of the bridge dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalEventKind {
    /// [`InternalEvent::AgentStarted`].
    AgentStarted,
    /// [`InternalEvent::AgentIdle`].
    AgentIdle,
    /// [`InternalEvent::ReasoningToken`].
    ReasoningToken,
    /// [`InternalEvent::ReasoningDone`].
    ReasoningDone,
    /// [`InternalEvent::TextToken`].
    TextToken,
    /// [`InternalEvent::AgentMessage`].
    AgentMessage,
    /// [`InternalEvent::Notice`].
    Notice,
    /// [`InternalEvent::Completed`].
    Completed,
    /// [`InternalEvent::Failed`].
    Failed,
}

impl InternalEventKind {
    /// Every kind.
    pub const ALL: [InternalEventKind; 9] = [
        InternalEventKind::AgentStarted,
        InternalEventKind::AgentIdle,
        InternalEventKind::ReasoningToken,
        InternalEventKind::ReasoningDone,
        InternalEventKind::TextToken,
        InternalEventKind::AgentMessage,
        InternalEventKind::Notice,
        InternalEventKind::Completed,
        InternalEventKind::Failed,
    ];
}

impl InternalEvent {
    /// Tag of this event.
    pub fn kind(&self) -> InternalEventKind {
        match self {
            InternalEvent::AgentStarted { .. } => InternalEventKind::AgentStarted,
            InternalEvent::AgentIdle { .. } => InternalEventKind::AgentIdle,
            InternalEvent::ReasoningToken { .. } => InternalEventKind::ReasoningToken,
            InternalEvent::ReasoningDone { .. } => InternalEventKind::ReasoningDone,
            InternalEvent::TextToken { .. } => InternalEventKind::TextToken,
            InternalEvent::AgentMessage { .. } => InternalEventKind::AgentMessage,
            InternalEvent::Notice { .. } => InternalEventKind::Notice,
            InternalEvent::Completed { .. } => InternalEventKind::Completed,
            InternalEvent::Failed { .. } => InternalEventKind::Failed,
        }
    }

    /// A notice event.
    pub fn notice(message: impl Into<String>, kind: NoticeKind) -> Self {
        InternalEvent::Notice {
            message: message.into(),
            kind,
        }
    }
}

/// Where a run's internal events go. Cloning shares the channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<InternalEvent>>,
}

impl EventSink {
    /// A sink feeding `tx`.
    pub fn new(tx: mpsc::Sender<InternalEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink and the receiving end, for tests and bridges.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InternalEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Send an event. A closed receiver is not an error: the run keeps going
    /// and notices cancellation at its next round boundary.
    pub async fn emit(&self, event: InternalEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// Emit a notice.
    pub async fn notice(&self, message: impl Into<String>, kind: NoticeKind) {
        self.emit(InternalEvent::notice(message, kind)).await;
    }
}

/// How much of an agent's stream reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Reasoning and answer text are both streamed.
    Full,
    /// Only reasoning is streamed. Used for agents whose text is control
    /// output (routing JSON, ledgers, verdicts).
    ReasoningOnly,
}

/// Invoke `agent` in streaming mode, forwarding its deltas into `sink`.
pub async fn stream_agent(
    agent: &dyn Agent,
    input: AgentInput,
    sink: &EventSink,
    visibility: Visibility,
) -> FleetResult<AgentOutput> {
    let name = agent.name().to_string();
    sink.emit(InternalEvent::AgentStarted {
        agent: name.clone(),
    })
    .await;

    let result = forward_stream(agent, input, sink, visibility, &name).await;

    sink.emit(InternalEvent::ReasoningDone {
        agent: name.clone(),
    })
    .await;
    if let (Ok(output), Visibility::Full) = (&result, visibility) {
        sink.emit(InternalEvent::AgentMessage {
            agent: name.clone(),
            content: output.text.clone(),
        })
        .await;
    }
    sink.emit(InternalEvent::AgentIdle { agent: name }).await;
    result
}

async fn forward_stream(
    agent: &dyn Agent,
    input: AgentInput,
    sink: &EventSink,
    visibility: Visibility,
    name: &str,
) -> FleetResult<AgentOutput> {
    let (mut rx, handle) = agent.invoke_stream(input).await?;
    while let Some(delta) = rx.recv().await {
        if delta.is_reasoning {
            sink.emit(InternalEvent::ReasoningToken {
                agent: name.to_string(),
                delta: delta.delta,
            })
            .await;
        } else if visibility == Visibility::Full {
            sink.emit(InternalEvent::TextToken {
                agent: name.to_string(),
                delta: delta.delta,
            })
            .await;
        }
    }
    handle
        .await
        .map_err(|e| FleetError::Agent(format!("Agent {name} task failed: {e}")))?
}
