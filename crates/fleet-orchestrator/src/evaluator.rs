use crate::router::extract_json;
use async_trait::async_trait;
use fleet_agent::{Agent, AgentInput};
use fleet_core::{FleetError, FleetResult};
use fleet_session::{ConversationStore, HistoryStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Estimates answer quality on a 0–1 scale.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    /// Score `answer` as a reply to `task`.
    async fn score(&self, task: &str, answer: &str) -> FleetResult<f64>;
}

const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i am unable",
    "i'm unable",
    "i don't know",
    "as an ai",
    "i'm sorry, but",
];

/// Deterministic scorer used when no judge is configured.
///
/// Length earns up to 0.4 (saturating at 50 words), overlap with the task's
/// terms up to 0.6. Refusals are capped at 0.2.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    /// Score in 0–1.
    pub fn estimate(task: &str, answer: &str) -> f64 {
        let answer_lower = answer.trim().to_lowercase();
        if answer_lower.is_empty() {
            return 0.0;
        }
        let words = answer_lower.split_whitespace().count() as f64;
        let length = (words / 50.0).min(1.0) * 0.4;

        let terms = significant_terms(task);
        let overlap = if terms.is_empty() {
            0.6
        } else {
            let answer_terms = significant_terms(&answer_lower);
            let hits = terms.iter().filter(|t| answer_terms.contains(*t)).count();
            (hits as f64 / terms.len() as f64) * 0.6
        };

        let score = length + overlap;
        if REFUSAL_MARKERS.iter().any(|m| answer_lower.contains(m)) {
            score.min(0.2)
        } else {
            score.clamp(0.0, 1.0)
        }
    }
}

fn significant_terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(String::from)
        .collect()
}

#[async_trait]
impl QualityScorer for HeuristicScorer {
    async fn score(&self, task: &str, answer: &str) -> FleetResult<f64> {
        Ok(Self::estimate(task, answer))
    }
}

/// Asks an agent (normally the judge) for a score.
pub struct AgentScorer {
    agent: Arc<dyn Agent>,
}

impl AgentScorer {
    /// Score with `agent`.
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    /// First number in the reply, or the `score` field of a JSON reply.
    /// Values above 1 are read as a 0–10 scale.
    pub fn parse_score(text: &str) -> Option<f64> {
        let raw = extract_json(text)
            .and_then(|v| v.get("score").and_then(serde_json::Value::as_f64))
            .or_else(|| first_number(text))?;
        let normalized = if raw > 1.0 { raw / 10.0 } else { raw };
        normalized.is_finite().then(|| normalized.clamp(0.0, 1.0))
    }
}

fn first_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}

#[async_trait]
impl QualityScorer for AgentScorer {
    async fn score(&self, task: &str, answer: &str) -> FleetResult<f64> {
        let input = AgentInput::new(format!("Task:\n{task}\n\nAnswer:\n{answer}"))
            .with_instructions(
                "Rate how well the answer solves the task. Reply with a single number between 0 and 1.",
            );
        let output = self.agent.invoke(input).await?;
        Self::parse_score(&output.text).ok_or_else(|| {
            FleetError::Agent(format!(
                "Scorer {} returned no score: {}",
                self.agent.name(),
                output.text
            ))
        })
    }
}

/// A finished response waiting to be scored.
#[derive(Debug, Clone)]
pub struct EvaluationTarget {
    /// Record to update.
    pub workflow_id: String,
    /// Conversation holding the answer, if any.
    pub conversation_id: Option<String>,
    /// Assistant message to annotate with the score.
    pub message_id: Option<Uuid>,
    /// What was asked.
    pub task: String,
    /// What was answered.
    pub answer: String,
}

/// 0–1 estimate to the 0–10 scale stored on records.
pub fn rescale(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    (raw * 10.0).clamp(0.0, 10.0)
}

/// Scores finished responses off the response path.
///
/// Each scheduled evaluation is a detached task tracked in a live set until
/// it finishes, so [`BackgroundEvaluator::drain`] can wait for all of them.
pub struct BackgroundEvaluator {
    scorer: Arc<dyn QualityScorer>,
    history: Arc<dyn HistoryStore>,
    conversations: Arc<dyn ConversationStore>,
    live: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl BackgroundEvaluator {
    /// Write scores to `history` and onto the answer message in `conversations`.
    pub fn new(
        scorer: Arc<dyn QualityScorer>,
        history: Arc<dyn HistoryStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            scorer,
            history,
            conversations,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn an evaluation. Returns `false` when nothing was scheduled:
    /// empty task or answer, or one already in flight for the workflow.
    pub fn schedule(&self, target: EvaluationTarget) -> bool {
        if target.task.trim().is_empty() || target.answer.trim().is_empty() {
            debug!(workflow_id = %target.workflow_id, "Skipping evaluation of empty exchange");
            return false;
        }

        let mut live = self.live.lock();
        if live.contains_key(&target.workflow_id) {
            debug!(workflow_id = %target.workflow_id, "Evaluation already in flight");
            return false;
        }
        let workflow_id = target.workflow_id.clone();
        let scorer = self.scorer.clone();
        let history = self.history.clone();
        let conversations = self.conversations.clone();
        let registry = self.live.clone();
        let key = workflow_id.clone();
        // The lock is held across spawn, so the task's own removal cannot
        // run before the insert below.
        let handle = tokio::spawn(async move {
            evaluate(scorer.as_ref(), history.as_ref(), conversations.as_ref(), target).await;
            registry.lock().remove(&key);
        });
        live.insert(workflow_id, handle);
        true
    }

    /// Evaluations still running.
    pub fn in_flight(&self) -> usize {
        self.live.lock().len()
    }

    /// Wait for every in-flight evaluation to finish.
    pub async fn drain(&self) {
        loop {
            let handles: Vec<_> = {
                let mut live = self.live.lock();
                live.drain().map(|(_, handle)| handle).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Evaluation task panicked");
                }
            }
        }
    }
}

async fn evaluate(
    scorer: &dyn QualityScorer,
    history: &dyn HistoryStore,
    conversations: &dyn ConversationStore,
    target: EvaluationTarget,
) {
    let raw = match scorer.score(&target.task, &target.answer).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(workflow_id = %target.workflow_id, error = %e, "Quality scoring failed");
            return;
        }
    };
    let score = rescale(raw);

    if let Err(e) = history.update_quality(&target.workflow_id, score).await {
        warn!(workflow_id = %target.workflow_id, error = %e, "Failed to store quality score");
    }
    if let (Some(conversation_id), Some(message_id)) = (&target.conversation_id, target.message_id)
    {
        if let Err(e) = conversations
            .annotate_message(conversation_id, message_id, "quality_score", score.into())
            .await
        {
            warn!(
                workflow_id = %target.workflow_id,
                conversation_id = %conversation_id,
                error = %e,
                "Failed to annotate message with quality score"
            );
        }
    }
    info!(workflow_id = %target.workflow_id, score, "Response evaluated");
}
