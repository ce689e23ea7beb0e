use async_trait::async_trait;
use fleet_core::{FleetResult, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What an agent is asked to do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInput {
    /// System-level instructions for this invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// The prompt (task text, instruction, or evaluation request).
    pub prompt: String,
    /// Prior conversation turns, oldest first.
    #[serde(default)]
    pub history: Vec<Message>,
    /// Caller extras passed through to the backend.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentInput {
    /// An input with only a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Set the system instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Set the prior conversation turns.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// The result of an agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Final answer text.
    pub text: String,
    /// Reasoning trace, for models that expose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Backend-specific extras such as token usage.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentOutput {
    /// Output with text only.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Attach a reasoning trace.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// One incremental fragment of a streamed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDelta {
    /// The new text.
    pub delta: String,
    /// Reasoning rather than answer text.
    pub is_reasoning: bool,
}

impl AgentDelta {
    /// An answer fragment.
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            is_reasoning: false,
        }
    }

    /// A reasoning fragment.
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            is_reasoning: true,
        }
    }
}

/// Receiver for stream deltas plus a join handle resolving to the final output.
pub type AgentStream = (
    mpsc::Receiver<AgentDelta>,
    JoinHandle<FleetResult<AgentOutput>>,
);

/// Black-box LLM-backed capability shared by every role.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable name used in events (`agent_id`) and in routing decisions.
    fn name(&self) -> &str;

    /// Non-streaming invocation.
    async fn invoke(&self, input: AgentInput) -> FleetResult<AgentOutput>;

    /// Streaming invocation.
    ///
    /// The default implementation calls [`Agent::invoke`] and replays the
    /// result as one reasoning delta followed by one text delta.
    async fn invoke_stream(&self, input: AgentInput) -> FleetResult<AgentStream> {
        let output = self.invoke(input).await?;
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            if let Some(reasoning) = output.reasoning.as_deref().filter(|r| !r.is_empty()) {
                let _ = tx.send(AgentDelta::reasoning(reasoning)).await;
            }
            if !output.text.is_empty() {
                let _ = tx.send(AgentDelta::text(output.text.as_str())).await;
            }
            Ok(output)
        });
        Ok((rx, handle))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl Agent for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn invoke(&self, input: AgentInput) -> FleetResult<AgentOutput> {
            Ok(AgentOutput::text(format!("echo: {}", input.prompt)).with_reasoning("thinking"))
        }
    }

    #[tokio::test]
    async fn test_default_stream_replays_reasoning_then_text() {
        let (mut rx, handle) = Fixed.invoke_stream(AgentInput::new("hi")).await.unwrap();
        let mut deltas = Vec::new();
        while let Some(d) = rx.recv().await {
            deltas.push(d);
        }
        let output = handle.await.unwrap().unwrap();

        assert_eq!(
            deltas,
            vec![AgentDelta::reasoning("thinking"), AgentDelta::text("echo: hi")]
        );
        assert_eq!(output.text, "echo: hi");
    }
}
