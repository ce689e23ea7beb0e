use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable state of one supervisor run. Snapshotted into checkpoints.
///
/// Invariants: `current_round <= max_rounds` and `stall_count <= max_stalls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    /// Run the state belongs to.
    pub workflow_id: String,
    /// Conversation of the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Rounds completed so far.
    pub current_round: u32,
    /// Consecutive rounds without progress.
    pub stall_count: u32,
    /// Most recent participant output.
    #[serde(default)]
    pub last_response: String,
    /// Task, plan, observations and loop counters. Everything needed to resume.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl OrchestratorState {
    /// Fresh state at round zero.
    pub fn new(workflow_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            conversation_id,
            current_round: 0,
            stall_count: 0,
            last_response: String::new(),
            context: Map::new(),
        }
    }

    /// String value stored under `key`.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Counter stored under `key`, or 0.
    pub fn context_u32(&self, key: &str) -> u32 {
        self.context
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set_context(&mut self, key: &str, value: impl Into<Value>) {
        self.context.insert(key.to_string(), value.into());
    }
}

/// Supervisor loop phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Writing or redoing the plan.
    Planning,
    /// Filling in the progress ledger.
    Evaluating,
    /// Running the chosen participant.
    Acting,
    /// Recording the outcome of the round.
    Observing,
    /// Done.
    Terminated,
}

/// Why the supervisor loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The planner judged the request satisfied.
    Satisfied,
    /// `max_rounds` was reached.
    MaxRounds,
    /// Stalls persisted after every allowed plan reset.
    MaxStalls,
    /// The caller cancelled the run.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Satisfied => write!(f, "satisfied"),
            TerminationReason::MaxRounds => write!(f, "max_rounds"),
            TerminationReason::MaxStalls => write!(f, "max_stalls"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_context_helpers() {
        let mut state = OrchestratorState::new("wf-1", None);
        state.set_context("plan", "do it");
        state.set_context("reset_count", 2);
        assert_eq!(state.context_str("plan"), Some("do it"));
        assert_eq!(state.context_u32("reset_count"), 2);
        assert_eq!(state.context_u32("missing"), 0);
    }

    #[test]
    fn test_termination_reason_serde() {
        let json = serde_json::to_string(&TerminationReason::MaxStalls).unwrap();
        assert_eq!(json, "\"max_stalls\"");
        assert_eq!(TerminationReason::MaxStalls.to_string(), "max_stalls");
    }
}
