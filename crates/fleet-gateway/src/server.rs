use crate::approval::HttpApprovalHandler;
use crate::error::ApiError;
use crate::middleware::{auth_middleware, AuthConfig};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fleet_core::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, EventStream, FleetError, RunContext,
    Task,
};
use fleet_orchestrator::{frame_stream, CheckpointMetadata, CheckpointService, WorkflowEngine};
use fleet_session::{RunHandle, SessionManager};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    /// Engine serving checkpoints and history.
    pub engine: WorkflowEngine,
    /// Runs started over HTTP.
    pub sessions: Arc<SessionManager>,
    /// Present when reviewers decide approvals over HTTP.
    pub approvals: Option<Arc<HttpApprovalHandler>>,
}

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(state: AppState) -> Router {
        Self::build_with_auth(state, AuthConfig::default())
    }

    /// Build the gateway, requiring an API key when `auth` lists any.
    pub fn build_with_auth(state: AppState, auth: AuthConfig) -> Router {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/workflows", post(start_workflow).get(list_workflows))
            .route("/v1/workflows/{id}", delete(cancel_workflow))
            .route("/v1/workflows/{id}/events", get(subscribe_workflow))
            .route(
                "/v1/checkpoints",
                get(list_checkpoints).delete(clear_checkpoints),
            )
            .route(
                "/v1/checkpoints/{id}",
                get(get_checkpoint).delete(delete_checkpoint),
            )
            .route("/v1/approvals", get(list_approvals))
            .route("/v1/approvals/{id}", post(decide_approval))
            .with_state(Arc::new(state));

        if auth.is_enabled() {
            app.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            app
        }
    }
}

/// Body of `POST /v1/workflows`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Task text.
    pub task: String,
    /// Conversation to continue.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Echoed on every event.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Caller-chosen workflow id; generated when absent.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Passed through as task metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Overrides the task default when set.
    #[serde(default)]
    pub use_cache: Option<bool>,
}

impl RunRequest {
    fn into_parts(self) -> (Task, RunContext) {
        let mut task = Task::new(self.task);
        task.conversation_id = self.conversation_id;
        task.correlation_id = self.correlation_id;
        task.metadata = self.metadata;
        if let Some(use_cache) = self.use_cache {
            task.use_cache = use_cache;
        }
        let mut ctx = match self.workflow_id {
            Some(id) => RunContext::with_workflow_id(id),
            None => RunContext::new(),
        };
        ctx.conversation_id = task.conversation_id.clone();
        ctx.correlation_id = task.correlation_id.clone();
        (task, ctx)
    }
}

/// Body of `POST /v1/approvals/{id}`.
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    /// Approved, rejected or revision requested.
    pub status: ApprovalStatus,
    /// Reason for the decision.
    #[serde(default)]
    pub feedback: String,
    /// Replacement parameters for a revision.
    #[serde(default)]
    pub revisions: Option<Map<String, Value>>,
    /// Reviewer name. Defaults to `http`.
    #[serde(default = "default_reviewer")]
    pub reviewed_by: String,
}

fn default_reviewer() -> String {
    "http".to_string()
}

impl DecisionRequest {
    fn into_decision(self) -> Result<ApprovalDecision, ApiError> {
        let mut decision = match self.status {
            ApprovalStatus::Approved => ApprovalDecision::approved(self.reviewed_by),
            ApprovalStatus::Rejected => ApprovalDecision::rejected("", self.reviewed_by),
            ApprovalStatus::RevisionRequested => {
                ApprovalDecision::revise(self.revisions.unwrap_or_default(), self.reviewed_by)
            }
            ApprovalStatus::Pending => {
                return Err(ApiError::bad_request("A decision cannot be pending"));
            }
        };
        decision.feedback = self.feedback;
        Ok(decision)
    }
}

/// Query of `GET /v1/checkpoints`.
#[derive(Debug, Deserialize)]
pub struct CheckpointQuery {
    /// Only list checkpoints of this workflow.
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkflowList {
    workflows: Vec<String>,
    active: usize,
    limit: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "fleet",
        "active_workflows": state.sessions.active_count(),
    }))
}

/// Frame events as SSE and wrap them in a streaming response.
fn sse_response(workflow_id: &str, events: EventStream) -> Result<Response, ApiError> {
    let body = Body::from_stream(frame_stream(events).map(Ok::<_, Infallible>));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-workflow-id", workflow_id)
        .body(body)
        .map_err(|e| ApiError::internal(format!("Cannot build response: {e}")))
}

fn handle_events(handle: RunHandle) -> EventStream {
    Box::pin(stream::unfold(handle, |mut handle| async move {
        handle.next_event().await.map(|event| (event, handle))
    }))
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    if request.task.trim().is_empty() {
        return Err(ApiError::bad_request("Task text must not be empty"));
    }
    let (task, ctx) = request.into_parts();
    let handle = state.sessions.start_with(task, ctx).await?;
    let workflow_id = handle.workflow_id.clone();
    info!(workflow_id = %workflow_id, "Streaming workflow over SSE");
    sse_response(&workflow_id, handle_events(handle))
}

async fn subscribe_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let receiver = state.sessions.subscribe(&id)?;
    let workflow_id = id.clone();
    let events = BroadcastStream::new(receiver).filter_map(move |item| {
        let workflow_id = workflow_id.clone();
        async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(workflow_id = %workflow_id, skipped, "SSE subscriber lagged behind");
                    None
                }
            }
        }
    });
    sse_response(&id, Box::pin(events))
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<WorkflowList> {
    Json(WorkflowList {
        workflows: state.sessions.active_workflows(),
        active: state.sessions.active_count(),
        limit: state.sessions.limit(),
    })
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.cancel(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workflow_id": id, "status": "cancelling" })),
    ))
}

fn checkpoints(state: &AppState) -> Result<Arc<dyn CheckpointService>, ApiError> {
    state
        .engine
        .checkpoints()
        .ok_or_else(|| FleetError::ResourceNotFound("checkpoints are disabled".into()).into())
}

async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckpointQuery>,
) -> Result<Json<Vec<CheckpointMetadata>>, ApiError> {
    let service = checkpoints(&state)?;
    Ok(Json(service.list(query.workflow_id.as_deref()).await?))
}

async fn get_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let service = checkpoints(&state)?;
    let restored = service.load(&id).await?;
    Ok(Json(json!({ "checkpoint_id": id, "state": restored })))
}

async fn delete_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    checkpoints(&state)?.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_checkpoints(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    checkpoints(&state)?.clear().await?;
    info!("All checkpoints cleared");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_approvals(State(state): State<Arc<AppState>>) -> Json<Vec<ApprovalRequest>> {
    match &state.approvals {
        Some(handler) => Json(handler.pending().await),
        None => Json(Vec::new()),
    }
}

async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handler = state.approvals.as_ref().ok_or_else(|| {
        ApiError::from(FleetError::ResourceNotFound(format!("approval request {id}")))
    })?;
    let decision = request.into_decision()?;
    let status = decision.status;
    handler.respond(&id, decision).await?;
    Ok(Json(json!({ "request_id": id, "status": status })))
}
