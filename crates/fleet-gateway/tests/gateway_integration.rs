#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use fleet_agent::{AgentDescriptor, AgentRegistry, AgentRole, ScriptedAgent};
use fleet_core::{ApprovalHandler, ApprovalRequest, ApprovalStatus, RunContext, Task};
use fleet_gateway::{AppState, AuthConfig, GatewayServer, HttpApprovalHandler};
use fleet_orchestrator::{
    ApprovalMode, CheckpointService, EngineBuilder, EngineConfig, OrchestratorState,
    WorkflowEngine, DONE_FRAME,
};
use fleet_session::SessionManager;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn registry() -> AgentRegistry {
    AgentRegistry::new()
        .with(
            AgentDescriptor::new("router", AgentRole::Router),
            Arc::new(ScriptedAgent::replies("router", vec![r#"{"pattern":"simple"}"#])),
        )
        .with(
            AgentDescriptor::new("planner", AgentRole::Planner),
            Arc::new(ScriptedAgent::replies("planner", vec!["1. answer"])),
        )
        .with(
            AgentDescriptor::new("worker", AgentRole::Worker),
            Arc::new(ScriptedAgent::replies("worker", vec!["Hello from the worker"])),
        )
}

async fn engine() -> WorkflowEngine {
    let mut config = EngineConfig::default();
    config.approval.mode = ApprovalMode::Disabled;
    EngineBuilder::new(config, registry())
        .build()
        .await
        .unwrap()
}

async fn state(approvals: Option<Arc<HttpApprovalHandler>>) -> AppState {
    let engine = engine().await;
    let sessions = Arc::new(SessionManager::new(
        Arc::new(engine.clone()),
        engine.config().session.clone(),
    ));
    AppState {
        engine,
        sessions,
        approvals,
    }
}

async fn app() -> Router {
    GatewayServer::build(state(None).await)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Split an SSE body into its frames, keeping the trailing blank line.
fn frames(body: &str) -> Vec<String> {
    body.split_inclusive("\n\n").map(String::from).collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = app().await.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "fleet");
}

#[tokio::test]
async fn test_run_streams_sse_until_done() {
    let response = app()
        .await
        .oneshot(post_json(
            "/v1/workflows",
            r#"{"task": "Analyze the deployment logs", "workflow_id": "wf-http", "conversation_id": "c-1"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers()["x-workflow-id"], "wf-http");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let frames = frames(&body);
    assert_eq!(frames.last().unwrap(), DONE_FRAME);
    assert!(frames.iter().all(|f| f.starts_with("data: ")));

    let completed: Value = serde_json::from_str(
        frames[frames.len() - 2]
            .trim_start_matches("data: ")
            .trim_end(),
    )
    .unwrap();
    assert_eq!(completed["type"], "response.completed");
    assert_eq!(completed["response"]["content"], "Hello from the worker");
    assert_eq!(completed["conversation_id"], "c-1");
    assert_eq!(completed["metadata"]["workflow_id"], "wf-http");
}

#[tokio::test]
async fn test_empty_task_is_bad_request() {
    let response = app()
        .await
        .oneshot(post_json("/v1/workflows", r#"{"task": "   "}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "bad_request");
}

#[tokio::test]
async fn test_unknown_workflow_routes_return_not_found() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/workflows/wf-nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "not_found");
    assert!(body["message"].as_str().unwrap().contains("wf-nope"));

    let response = app
        .oneshot(get("/v1/workflows/wf-nope/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_workflows_when_idle() {
    let response = app().await.oneshot(get("/v1/workflows")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["workflows"], serde_json::json!([]));
    assert_eq!(body["active"], 0);
    assert_eq!(body["limit"], 16);
}

#[tokio::test]
async fn test_checkpoint_routes() {
    let state = state(None).await;
    let service = state.engine.checkpoints().unwrap();
    let mut saved = OrchestratorState::new("wf-cp", None);
    saved.current_round = 2;
    let id = service.save(&saved).await.unwrap();
    let app = GatewayServer::build(state);

    let response = app
        .clone()
        .oneshot(get("/v1/checkpoints?workflow_id=wf-cp"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["checkpoint_id"], id.as_str());
    assert_eq!(body[0]["current_round"], 2);

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/checkpoints/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["state"]["workflow_id"], "wf-cp");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/checkpoints/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get(&format!("/v1/checkpoints/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_approval_decided_over_http() {
    let handler = Arc::new(HttpApprovalHandler::new(Duration::from_secs(5)));
    let app = GatewayServer::build(state(Some(handler.clone())).await);

    let mut request = ApprovalRequest::new("agent_invocation", "deployer", "Deploy prod");
    request.request_id = "req-1".into();
    let waiting = handler.clone();
    let pending = tokio::spawn(async move { waiting.request_approval(request).await });
    while handler.pending_count().await == 0 {
        tokio::task::yield_now().await;
    }

    let response = app.clone().oneshot(get("/v1/approvals")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body[0]["request_id"], "req-1");

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/approvals/req-1",
            r#"{"status": "rejected", "feedback": "not on a Friday", "reviewed_by": "alice"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let decision = pending.await.unwrap().unwrap();
    assert_eq!(decision.status, ApprovalStatus::Rejected);
    assert_eq!(decision.feedback, "not on a Friday");
    assert_eq!(decision.reviewed_by, "alice");

    let response = app
        .oneshot(post_json("/v1/approvals/req-1", r#"{"status": "approved"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pending_decision_is_bad_request() {
    let handler = Arc::new(HttpApprovalHandler::new(Duration::from_secs(5)));
    let app = GatewayServer::build(state(Some(handler)).await);
    let response = app
        .oneshot(post_json("/v1/approvals/req-9", r#"{"status": "pending"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_auth_required_when_keys_configured() {
    let app = GatewayServer::build_with_auth(
        state(None).await,
        AuthConfig::new(vec!["secret".into()]),
    );

    let response = app.clone().oneshot(get("/v1/workflows")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/workflows")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sse_over_real_socket() {
    let app = app().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/workflows"))
        .json(&serde_json::json!({ "task": "ok" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = frames(&body);
    assert_eq!(frames.last().unwrap(), DONE_FRAME);
    assert!(frames
        .iter()
        .any(|f| f.contains("\"type\":\"message.delta\"")));
    assert!(frames[frames.len() - 2].contains("\"fast_path\":true"));
}

#[tokio::test]
async fn test_cancel_releases_run_waiting_for_approval() {
    let handler = Arc::new(HttpApprovalHandler::new(Duration::from_secs(300)));
    let mut config = EngineConfig::default();
    config.approval.mode = ApprovalMode::Required;
    let registry = AgentRegistry::new()
        .with(
            AgentDescriptor::new("router", AgentRole::Router),
            Arc::new(ScriptedAgent::replies("router", vec![r#"{"pattern":"simple"}"#])),
        )
        .with(
            AgentDescriptor::new("planner", AgentRole::Planner),
            Arc::new(ScriptedAgent::replies("planner", vec!["1. deploy"])),
        )
        .with(
            AgentDescriptor::new("deployer", AgentRole::Worker).side_effecting(),
            Arc::new(ScriptedAgent::replies("deployer", vec!["deployed"])),
        );
    let engine = EngineBuilder::new(config, registry)
        .approval_handler(handler.clone())
        .build()
        .await
        .unwrap();
    let sessions = Arc::new(SessionManager::new(
        Arc::new(engine.clone()),
        engine.config().session.clone(),
    ));
    let app = GatewayServer::build(AppState {
        engine,
        sessions: sessions.clone(),
        approvals: Some(handler.clone()),
    });

    let mut run = sessions
        .start_with(
            Task::new("Deploy the release build"),
            RunContext::with_workflow_id("wf-gated"),
        )
        .await
        .unwrap();
    while handler.pending_count().await == 0 {
        tokio::task::yield_now().await;
    }

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/workflows/wf-gated")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = run.next_event().await {
            if event.is_terminal() {
                break;
            }
        }
    })
    .await
    .expect("cancelled run kept waiting for its reviewer");
    assert_eq!(handler.pending_count().await, 0);
}
