//! OpenAI-compatible backend against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use fleet_agent::{Agent, AgentConfig, AgentInput, AgentProvider, AgentRole, OpenAiAgent};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> AgentConfig {
    let mut config = AgentConfig::scripted("analyst", AgentRole::Analyst, vec![]);
    config.provider = AgentProvider::OpenAi;
    config.model_id = "test-model".into();
    config.api_key = "sk-test".into();
    config.api_base_url = Some(server.uri());
    config
}

#[tokio::test]
async fn test_invoke_parses_text_and_reasoning() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Paris", "reasoning_content": "capital of France"}
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let agent = OpenAiAgent::new(config_for(&server));
    let output = agent.invoke(AgentInput::new("capital?")).await.unwrap();
    assert_eq!(output.text, "Paris");
    assert_eq!(output.reasoning.as_deref(), Some("capital of France"));
}

#[tokio::test]
async fn test_invoke_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(serde_json::json!({"error": "slow down"})),
        )
        .mount(&server)
        .await;

    let agent = OpenAiAgent::new(config_for(&server));
    let err = agent.invoke(AgentInput::new("x")).await.unwrap_err();
    assert!(err.to_string().contains("429"));
}

#[tokio::test]
async fn test_stream_yields_deltas_in_order() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"ok\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let agent = OpenAiAgent::new(config_for(&server));
    let (mut rx, handle) = agent.invoke_stream(AgentInput::new("hi")).await.unwrap();

    let mut deltas = Vec::new();
    while let Some(d) = rx.recv().await {
        deltas.push((d.is_reasoning, d.delta));
    }
    assert_eq!(
        deltas,
        vec![
            (true, "hmm ".to_string()),
            (true, "ok".to_string()),
            (false, "Hel".to_string()),
            (false, "lo".to_string()),
        ]
    );

    let output = handle.await.unwrap().unwrap();
    assert_eq!(output.text, "Hello");
    assert_eq!(output.reasoning.as_deref(), Some("hmm ok"));
}

#[test]
fn test_agent_config_from_toml() {
    let config: AgentConfig = toml::from_str(
        r#"
        name = "coder"
        role = "coder"
        provider = "openai"
        model_id = "gpt-4o-mini"
        api_key_env = "FLEET_TEST_UNSET_KEY"
        side_effecting = true
        "#,
    )
    .unwrap();
    assert_eq!(config.role, AgentRole::Coder);
    assert!(config.side_effecting);
    assert_eq!(config.api_base_url, None);
    assert_eq!(config.resolved_api_key(), "");
}
