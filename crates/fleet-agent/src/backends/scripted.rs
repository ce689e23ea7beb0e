use crate::agent::{Agent, AgentDelta, AgentInput, AgentOutput, AgentStream};
use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// One canned reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    /// Answer text.
    pub text: String,
    /// Reasoning emitted before the answer.
    pub reasoning: Option<String>,
    /// When set, the invocation fails with this message instead.
    pub failure: Option<String>,
}

impl ScriptedReply {
    /// A text-only reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Add reasoning to the reply.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// A reply that fails the invocation.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }
}

type Responder = Box<dyn Fn(&AgentInput) -> FleetResult<AgentOutput> + Send + Sync>;

enum Script {
    Replies(Vec<ScriptedReply>),
    Function(Responder),
}

/// Agent that replays canned replies, for offline runs and tests.
///
/// Replies are consumed in order; once exhausted the last reply repeats.
/// Streaming splits the reply at word boundaries so consumers see real deltas.
pub struct ScriptedAgent {
    name: String,
    script: Script,
    cursor: AtomicUsize,
    delay: Option<Duration>,
    calls: Mutex<Vec<AgentInput>>,
}

impl ScriptedAgent {
    /// Replay `replies` in order.
    pub fn new(name: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        Self::with_script(name, Script::Replies(replies))
    }

    /// Shorthand for text-only replies.
    pub fn replies<S: Into<String>>(name: impl Into<String>, texts: Vec<S>) -> Self {
        Self::new(name, texts.into_iter().map(ScriptedReply::text).collect())
    }

    /// An agent that always fails.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, vec![ScriptedReply::failure(message)])
    }

    /// An agent whose output is computed from its input.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&AgentInput) -> FleetResult<AgentOutput> + Send + Sync + 'static,
    {
        Self::with_script(name, Script::Function(Box::new(f)))
    }

    fn with_script(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
            cursor: AtomicUsize::new(0),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering, to simulate network latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Inputs received so far, oldest first.
    pub fn calls(&self) -> Vec<AgentInput> {
        self.calls.lock().clone()
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_output(&self, input: &AgentInput) -> FleetResult<AgentOutput> {
        match &self.script {
            Script::Function(f) => f(input),
            Script::Replies(replies) => {
                let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
                let Some(reply) = replies.get(idx).or_else(|| replies.last()) else {
                    return Ok(AgentOutput::default());
                };
                if let Some(message) = &reply.failure {
                    return Err(FleetError::Agent(message.clone()));
                }
                let mut output = AgentOutput::text(reply.text.clone());
                output.reasoning = reply.reasoning.clone();
                Ok(output)
            }
        }
    }

    async fn respond(&self, input: AgentInput) -> FleetResult<AgentOutput> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let output = self.next_output(&input);
        self.calls.lock().push(input);
        output
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: AgentInput) -> FleetResult<AgentOutput> {
        self.respond(input).await
    }

    async fn invoke_stream(&self, input: AgentInput) -> FleetResult<AgentStream> {
        let output = self.respond(input).await?;
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            if let Some(reasoning) = &output.reasoning {
                for word in reasoning.split_inclusive(' ') {
                    let _ = tx.send(AgentDelta::reasoning(word)).await;
                }
            }
            for word in output.text.split_inclusive(' ') {
                let _ = tx.send(AgentDelta::text(word)).await;
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

    #[tokio::test]
    async fn test_replies_in_order_then_repeat_last() {
        let agent = ScriptedAgent::replies("w", vec!["one", "two"]);
        for expected in ["one", "two", "two"] {
            let out = agent.invoke(AgentInput::new("x")).await.unwrap();
            assert_eq!(out.text, expected);
        }
        assert_eq!(agent.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_agent() {
        let agent = ScriptedAgent::failing("w", "rate limited");
        let err = agent.invoke(AgentInput::new("x")).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_stream_splits_words() {
        let agent = ScriptedAgent::new(
            "w",
            vec![ScriptedReply::text("hello big world").with_reasoning("let me see")],
        );
        let (mut rx, handle) = agent.invoke_stream(AgentInput::new("x")).await.unwrap();
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut count = 0;
        while let Some(d) = rx.recv().await {
            count += 1;
            if d.is_reasoning {
                reasoning.push_str(&d.delta);
            } else {
                text.push_str(&d.delta);
            }
        }
        assert_eq!(count, 6);
        assert_eq!(text, "hello big world");
        assert_eq!(reasoning, "let me see");
        assert_eq!(handle.await.unwrap().unwrap().text, "hello big world");
    }

    #[tokio::test]
    async fn test_from_fn_sees_input() {
        let agent = ScriptedAgent::from_fn("echo", |input| {
            Ok(AgentOutput::text(input.prompt.to_uppercase()))
        });
        let out = agent.invoke(AgentInput::new("abc")).await.unwrap();
        assert_eq!(out.text, "ABC");
        assert_eq!(agent.calls()[0].prompt, "abc");
    }
}
