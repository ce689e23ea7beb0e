//! Integration tests for fleet-core: the RunsWorkflow boundary and event contract.

use async_trait::async_trait;
use fleet_core::{
    ApprovalDecision, ApprovalHandler, ApprovalRequest, ApprovalStatus, EventKind, EventStream,
    FleetResult, RunContext, RunsWorkflow, Task, WorkflowEvent,
};
use futures_util::StreamExt;
use serde_json::Map;

struct EchoWorkflow;

#[async_trait]
impl RunsWorkflow for EchoWorkflow {
    async fn run(&self, task: Task, ctx: RunContext) -> FleetResult<EventStream> {
        let correlation = ctx.correlation_id.clone();
        let events = vec![
            WorkflowEvent::message_delta("echo", &task.text),
            WorkflowEvent::response_completed(&task.text, Map::new(), None),
        ]
        .into_iter()
        .map(move |e| e.with_correlation(correlation.clone()));
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

#[tokio::test]
async fn test_runs_workflow_stream_ends_with_terminal_event() {
    let task = Task::new("ping").with_correlation("corr-42");
    let ctx = RunContext::for_task(&task);
    let events: Vec<WorkflowEvent> = EchoWorkflow.run(task, ctx).await.unwrap().collect().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_kind(), Some(EventKind::MessageDelta));
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events
        .iter()
        .all(|e| e.correlation_id.as_deref() == Some("corr-42")));
}

struct RejectAll;

#[async_trait]
impl ApprovalHandler for RejectAll {
    async fn request_approval(&self, request: ApprovalRequest) -> FleetResult<ApprovalDecision> {
        Ok(ApprovalDecision::rejected(
            format!("{} is not allowed", request.operation_type),
            "policy",
        ))
    }
}

#[tokio::test]
async fn test_approval_handler_as_trait_object() {
    let handler: Box<dyn ApprovalHandler> = Box::new(RejectAll);
    let decision = handler
        .request_approval(ApprovalRequest::new("code_execution", "coder", "rm -rf build"))
        .await
        .unwrap();
    assert_eq!(decision.status, ApprovalStatus::Rejected);
    assert_eq!(decision.feedback, "code_execution is not allowed");
    assert_eq!(decision.reviewed_by, "policy");
}

#[test]
fn test_task_round_trip_keeps_metadata() {
    let task = Task::new("analyze logs")
        .with_conversation("conv-1")
        .with_metadata("priority", serde_json::json!(3));
    let json = serde_json::to_string(&task).unwrap();
    let parsed: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.conversation_id.as_deref(), Some("conv-1"));
    assert_eq!(parsed.metadata["priority"], 3);
}
