use crate::agent::{Agent, AgentDelta, AgentInput, AgentOutput, AgentStream};
use crate::config::AgentConfig;
use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult, Role};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

/// OpenAI-compatible chat completions agent.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, vLLM and any other provider
/// that implements the chat completions API. Reasoning models that expose a
/// `reasoning_content` (or `reasoning`) field have it surfaced as reasoning.
pub struct OpenAiAgent {
    config: AgentConfig,
    http: reqwest::Client,
}

impl OpenAiAgent {
    /// Build an agent for `config`. The HTTP client is created once.
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(&self, input: &AgentInput) -> Vec<serde_json::Value> {
        let mut api_messages = Vec::with_capacity(input.history.len() + 2);

        let system = input
            .instructions
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(Some(self.config.instructions.as_str()).filter(|s| !s.is_empty()));
        if let Some(sys) = system {
            api_messages.push(serde_json::json!({"role": "system", "content": sys}));
        }

        for m in &input.history {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            api_messages.push(serde_json::json!({"role": role, "content": m.content}));
        }

        api_messages.push(serde_json::json!({"role": "user", "content": input.prompt}));
        api_messages
    }

    fn request(&self, input: &AgentInput, stream: bool) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(input),
            "stream": stream,
        });
        self.http
            .post(url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resolved_api_key()),
            )
            .json(&body)
    }
}

#[async_trait]
impl Agent for OpenAiAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn invoke(&self, input: AgentInput) -> FleetResult<AgentOutput> {
        let resp = self
            .request(&input, false)
            .send()
            .await
            .map_err(|e| FleetError::Http(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FleetError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(FleetError::Http(format!(
                "Chat completions error {status}: {body}"
            )));
        }

        parse_completion(&body)
    }

    async fn invoke_stream(&self, input: AgentInput) -> FleetResult<AgentStream> {
        let resp = self
            .request(&input, true)
            .send()
            .await
            .map_err(|e| FleetError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(FleetError::Http(format!(
                "Chat completions error {status}: {error_body}"
            )));
        }

        let (tx, rx) = mpsc::channel::<AgentDelta>(256);
        let agent = self.config.name.clone();
        let mut stream = resp.bytes_stream();

        let handle = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut text = String::new();
            let mut reasoning = String::new();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return Err(FleetError::Http(format!("Stream read error: {e}")));
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        debug!(agent = %agent, "Stream finished");
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };

                    let delta = &event["choices"][0]["delta"];
                    if let Some(r) = reasoning_field(delta).filter(|r| !r.is_empty()) {
                        reasoning.push_str(r);
                        let _ = tx.send(AgentDelta::reasoning(r)).await;
                    }
                    if let Some(c) = delta["content"].as_str().filter(|c| !c.is_empty()) {
                        text.push_str(c);
                        let _ = tx.send(AgentDelta::text(c)).await;
                    }
                }
            }

            let mut output = AgentOutput::text(text);
            if !reasoning.is_empty() {
                output.reasoning = Some(reasoning);
            }
            Ok::<_, FleetError>(output)
        });

        Ok((rx, handle))
    }
}

fn reasoning_field(value: &serde_json::Value) -> Option<&str> {
    value["reasoning_content"]
        .as_str()
        .or_else(|| value["reasoning"].as_str())
}

/// Extract text and reasoning from a non-streaming completion body.
pub fn parse_completion(body: &serde_json::Value) -> FleetResult<AgentOutput> {
    let message = &body["choices"][0]["message"];
    if message.is_null() {
        return Err(FleetError::Agent(format!(
            "Completion has no choices: {body}"
        )));
    }
    let mut output = AgentOutput::text(message["content"].as_str().unwrap_or_default());
    if let Some(r) = reasoning_field(message).filter(|r| !r.is_empty()) {
        output.reasoning = Some(r.to_string());
    }
    Ok(output)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_with_reasoning() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "42", "reasoning_content": "6 * 7"}}]
        });
        let output = parse_completion(&body).unwrap();
        assert_eq!(output.text, "42");
        assert_eq!(output.reasoning.as_deref(), Some("6 * 7"));
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let body = serde_json::json!({"error": "nope"});
        assert!(parse_completion(&body).is_err());
    }

    #[test]
    fn test_build_messages_prefers_input_instructions() {
        let mut config = AgentConfig::scripted("w", crate::AgentRole::Worker, vec![]);
        config.instructions = "default system".into();
        let agent = OpenAiAgent::new(config);

        let msgs = agent.build_messages(
            &AgentInput::new("question")
                .with_instructions("override")
                .with_history(vec![fleet_core::Message::assistant("earlier")]),
        );
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["content"], "override");
        assert_eq!(msgs[1]["role"], "assistant");
        assert_eq!(msgs[2]["content"], "question");

        let msgs = agent.build_messages(&AgentInput::new("q"));
        assert_eq!(msgs[0]["content"], "default system");
    }
}
