//! Reshapes [`InternalEvent`]s into [`WorkflowEvent`]s.
//!
//! Each internal event kind has its own handler, looked up in a dispatch
//! table. The aggregator only observes: it never touches supervisor or
//! checkpoint state.

use crate::events::{InternalEvent, InternalEventKind};
use fleet_core::{CancellationToken, WorkflowEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Handler = fn(&mut Aggregator, InternalEvent) -> Vec<WorkflowEvent>;

fn dispatch_table() -> HashMap<InternalEventKind, Handler> {
    let table: [(InternalEventKind, Handler); 9] = [
        (InternalEventKind::AgentStarted, on_agent_started),
        (InternalEventKind::AgentIdle, on_status),
        (InternalEventKind::ReasoningToken, on_reasoning_token),
        (InternalEventKind::ReasoningDone, on_reasoning_done),
        (InternalEventKind::TextToken, on_text_token),
        (InternalEventKind::AgentMessage, on_agent_message),
        (InternalEventKind::Notice, on_notice),
        (InternalEventKind::Completed, on_completed),
        (InternalEventKind::Failed, on_failed),
    ];
    table.into_iter().collect()
}

/// Per-run event aggregator.
///
/// Buffers reasoning and answer deltas per agent, emits
/// `reasoning.completed` once per reasoning stream, `message.done` once per
/// agent at the end of the run, and guarantees exactly one terminal event.
pub struct Aggregator {
    handlers: HashMap<InternalEventKind, Handler>,
    correlation_id: Option<String>,
    reasoning: HashMap<String, String>,
    text: HashMap<String, String>,
    last_message: HashMap<String, String>,
    /// Agents that produced answer text, in first-seen order.
    speakers: Vec<String>,
    finished: bool,
}

impl Aggregator {
    /// An aggregator that tags every event with `correlation_id`.
    pub fn new(correlation_id: Option<String>) -> Self {
        Self {
            handlers: dispatch_table(),
            correlation_id,
            reasoning: HashMap::new(),
            text: HashMap::new(),
            last_message: HashMap::new(),
            speakers: Vec::new(),
            finished: false,
        }
    }

    /// Convert one internal event into zero or more wire events.
    pub fn convert(&mut self, event: InternalEvent) -> Vec<WorkflowEvent> {
        if self.finished {
            debug!(kind = ?event.kind(), "Dropping event after terminal event");
            return Vec::new();
        }
        let Some(handler) = self.handlers.get(&event.kind()).copied() else {
            return Vec::new();
        };
        let correlation_id = self.correlation_id.clone();
        handler(self, event)
            .into_iter()
            .map(|e| e.with_correlation(correlation_id.clone()))
            .collect()
    }

    /// Close the run. If no terminal event was produced, emit an error.
    pub fn finish(&mut self) -> Vec<WorkflowEvent> {
        if self.finished {
            return Vec::new();
        }
        warn!("Event stream closed without a terminal event");
        self.convert(InternalEvent::Failed {
            message: "Workflow ended without a result".into(),
            agent: None,
        })
    }

    /// Whether a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn flush_reasoning(&mut self, agent: &str) -> Option<WorkflowEvent> {
        let reasoning = self.reasoning.remove(agent)?;
        if reasoning.is_empty() {
            return None;
        }
        Some(WorkflowEvent::reasoning_completed(agent, &reasoning))
    }

    fn flush_all_reasoning(&mut self) -> Vec<WorkflowEvent> {
        let mut agents: Vec<String> = self.reasoning.keys().cloned().collect();
        agents.sort();
        agents
            .iter()
            .filter_map(|agent| self.flush_reasoning(agent))
            .collect()
    }
}

fn on_agent_started(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    if let InternalEvent::AgentStarted { agent } = event {
        agg.text.remove(&agent);
    }
    Vec::new()
}

/// Status events carry no client-visible information.
fn on_status(_agg: &mut Aggregator, _event: InternalEvent) -> Vec<WorkflowEvent> {
    Vec::new()
}

fn on_reasoning_token(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::ReasoningToken { agent, delta } = event else {
        return Vec::new();
    };
    agg.reasoning.entry(agent.clone()).or_default().push_str(&delta);
    vec![WorkflowEvent::reasoning_delta(&agent, &delta)]
}

fn on_reasoning_done(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::ReasoningDone { agent } = event else {
        return Vec::new();
    };
    agg.flush_reasoning(&agent).into_iter().collect()
}

fn on_text_token(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::TextToken { agent, delta } = event else {
        return Vec::new();
    };
    let mut out: Vec<WorkflowEvent> = agg.flush_reasoning(&agent).into_iter().collect();
    if !agg.speakers.contains(&agent) {
        agg.speakers.push(agent.clone());
    }
    agg.text.entry(agent.clone()).or_default().push_str(&delta);
    out.push(WorkflowEvent::message_delta(&agent, &delta));
    out
}

fn on_agent_message(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::AgentMessage { agent, content } = event else {
        return Vec::new();
    };
    let out = agg.flush_reasoning(&agent).into_iter().collect();
    if !agg.speakers.contains(&agent) {
        agg.speakers.push(agent.clone());
    }
    agg.text.remove(&agent);
    agg.last_message.insert(agent, content);
    out
}

fn on_notice(_agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::Notice { message, kind } = event else {
        return Vec::new();
    };
    vec![WorkflowEvent::orchestrator_message(&message, kind.as_str())]
}

fn on_completed(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::Completed {
        content,
        metadata,
        conversation_id,
    } = event
    else {
        return Vec::new();
    };
    let mut out = agg.flush_all_reasoning();
    for agent in std::mem::take(&mut agg.speakers) {
        let message = agg
            .last_message
            .remove(&agent)
            .or_else(|| agg.text.remove(&agent))
            .unwrap_or_default();
        out.push(WorkflowEvent::message_done(&agent, &message));
    }
    out.push(WorkflowEvent::response_completed(
        &content,
        metadata,
        conversation_id.as_deref(),
    ));
    agg.finished = true;
    out
}

fn on_failed(agg: &mut Aggregator, event: InternalEvent) -> Vec<WorkflowEvent> {
    let InternalEvent::Failed { message, agent } = event else {
        return Vec::new();
    };
    let mut out = agg.flush_all_reasoning();
    out.push(WorkflowEvent::error(&message, agent.as_deref()));
    agg.finished = true;
    out
}

/// Pump internal events through an aggregator into `output` until the
/// internal channel closes.
///
/// If the consumer goes away the run is cancelled; remaining internal events
/// are drained so producers never block.
pub async fn run_bridge(
    mut input: mpsc::Receiver<InternalEvent>,
    output: mpsc::Sender<WorkflowEvent>,
    mut aggregator: Aggregator,
    cancellation: CancellationToken,
) {
    let mut consumer_gone = false;
    while let Some(event) = input.recv().await {
        for wire in aggregator.convert(event) {
            if consumer_gone {
                break;
            }
            if output.send(wire).await.is_err() {
                debug!("Event consumer disconnected, cancelling run");
                consumer_gone = true;
                cancellation.cancel();
            }
        }
    }
    if !consumer_gone {
        for wire in aggregator.finish() {
            if output.send(wire).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::NoticeKind;
    use fleet_core::EventKind;
    use serde_json::Map;

    fn kinds(events: &[WorkflowEvent]) -> Vec<&str> {
        events.iter().map(|e| e.kind.as_str()).collect()
    }

    fn reasoning(agent: &str, delta: &str) -> InternalEvent {
        InternalEvent::ReasoningToken {
            agent: agent.into(),
            delta: delta.into(),
        }
    }

    fn text(agent: &str, delta: &str) -> InternalEvent {
        InternalEvent::TextToken {
            agent: agent.into(),
            delta: delta.into(),
        }
    }

    fn completed(content: &str) -> InternalEvent {
        InternalEvent::Completed {
            content: content.into(),
            metadata: Map::new(),
            conversation_id: Some("conv-1".into()),
        }
    }

    #[test]
    fn test_status_events_are_swallowed() {
        let mut agg = Aggregator::new(None);
        assert!(agg
            .convert(InternalEvent::AgentStarted { agent: "w".into() })
            .is_empty());
        assert!(agg
            .convert(InternalEvent::AgentIdle { agent: "w".into() })
            .is_empty());
    }

    #[test]
    fn test_reasoning_is_completed_once_when_text_starts() {
        let mut agg = Aggregator::new(None);
        agg.convert(reasoning("w", "let me "));
        agg.convert(reasoning("w", "think"));
        let out = agg.convert(text("w", "Answer"));
        assert_eq!(kinds(&out), vec!["reasoning.completed", "message.delta"]);
        assert_eq!(out[0].data["reasoning"], "let me think");

        assert!(agg
            .convert(InternalEvent::ReasoningDone { agent: "w".into() })
            .is_empty());
    }

    #[test]
    fn test_completion_flushes_message_done_per_agent_then_response() {
        let mut agg = Aggregator::new(Some("corr-7".into()));
        agg.convert(text("researcher", "facts"));
        agg.convert(InternalEvent::AgentMessage {
            agent: "researcher".into(),
            content: "facts".into(),
        });
        agg.convert(text("coder", "code"));
        agg.convert(InternalEvent::AgentMessage {
            agent: "coder".into(),
            content: "code".into(),
        });

        let out = agg.convert(completed("final"));
        assert_eq!(
            kinds(&out),
            vec!["message.done", "message.done", "response.completed"]
        );
        assert_eq!(out[0].agent_id(), Some("researcher"));
        assert_eq!(out[1].data["content"], "code");
        assert_eq!(out[2].data["response"]["content"], "final");
        assert_eq!(out[2].data["conversation_id"], "conv-1");
        assert!(out.iter().all(|e| e.correlation_id.as_deref() == Some("corr-7")));
    }

    #[test]
    fn test_nothing_after_terminal_event() {
        let mut agg = Aggregator::new(None);
        agg.convert(text("w", "x"));
        agg.convert(completed("x"));
        assert!(agg.convert(text("w", "late")).is_empty());
        assert!(agg
            .convert(InternalEvent::Failed {
                message: "late".into(),
                agent: None
            })
            .is_empty());
        assert!(agg.finish().is_empty());
    }

    #[test]
    fn test_failure_produces_error_event() {
        let mut agg = Aggregator::new(None);
        agg.convert(reasoning("planner", "hmm"));
        let out = agg.convert(InternalEvent::Failed {
            message: "Agent planner failed: timeout".into(),
            agent: Some("planner".into()),
        });
        assert_eq!(kinds(&out), vec!["reasoning.completed", "error"]);
        assert_eq!(out[1].data["error"], "Agent planner failed: timeout");
        assert_eq!(out[1].agent_id(), Some("planner"));
    }

    #[test]
    fn test_finish_without_terminal_emits_error() {
        let mut agg = Aggregator::new(None);
        agg.convert(text("w", "partial"));
        let out = agg.finish();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_kind(), Some(EventKind::Error));
        assert!(agg.is_finished());
    }

    #[test]
    fn test_notice_maps_to_orchestrator_message() {
        let mut agg = Aggregator::new(None);
        let out = agg.convert(InternalEvent::notice("1. research", NoticeKind::Plan));
        assert_eq!(out[0].kind, "orchestrator.message");
        assert_eq!(out[0].data["kind"], "plan");
        assert_eq!(out[0].data["message"], "1. research");
    }

    #[tokio::test]
    async fn test_bridge_preserves_order_and_closes_with_terminal() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let bridge = tokio::spawn(run_bridge(
            in_rx,
            out_tx,
            Aggregator::new(None),
            CancellationToken::new(),
        ));

        for delta in ["a", "b", "c"] {
            in_tx.send(text("w", delta)).await.unwrap();
        }
        drop(in_tx);
        bridge.await.unwrap();

        let mut deltas = Vec::new();
        let mut last = None;
        while let Some(e) = out_rx.recv().await {
            if e.kind == "message.delta" {
                deltas.push(e.data["delta"].as_str().unwrap().to_string());
            }
            last = Some(e);
        }
        assert_eq!(deltas, vec!["a", "b", "c"]);
        assert!(last.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_bridge_cancels_when_consumer_leaves() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let cancellation = CancellationToken::new();
        drop(out_rx);
        let bridge = tokio::spawn(run_bridge(
            in_rx,
            out_tx,
            Aggregator::new(None),
            cancellation.clone(),
        ));
        in_tx.send(text("w", "x")).await.unwrap();
        drop(in_tx);
        bridge.await.unwrap();
        assert!(cancellation.is_cancelled());
    }
}
