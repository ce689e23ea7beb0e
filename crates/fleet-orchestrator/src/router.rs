use crate::config::TeamConfig;
use crate::events::{stream_agent, EventSink, Visibility};
use fleet_agent::{Agent, AgentDescriptor, AgentInput};
use fleet_core::{Message, RunContext, Task};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

/// Team used when the router names none.
pub const DEFAULT_TEAM: &str = "default";

/// How much of the workflow graph a task needs.
///
/// Unknown values are kept (lower-cased) rather than rejected; the graph
/// treats them like [`Pattern::Simple`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Pattern {
    /// Answer with a single agent call, no team.
    Direct,
    /// Router then worker.
    #[default]
    Simple,
    /// Plan, supervisor loop and judge.
    Complex,
    /// Unrecognized value, treated as simple.
    Other(String),
}

/// Synonym table: raw router vocabulary to canonical pattern name.
const SYNONYMS: &[(&str, &str)] = &[
    ("direct", "direct"),
    ("direct_answer", "direct"),
    ("simple", "simple"),
    ("simple_tool", "simple"),
    ("complex", "complex"),
    ("complex_council", "complex"),
];

impl Pattern {
    /// Case-insensitive synonym lookup. Empty input means `simple`.
    pub fn normalize(raw: &str) -> Pattern {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            return Pattern::Simple;
        }
        let canonical = SYNONYMS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, canonical)| *canonical);
        match canonical {
            Some("direct") => Pattern::Direct,
            Some("simple") => Pattern::Simple,
            Some("complex") => Pattern::Complex,
            _ => Pattern::Other(key),
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Direct => "direct",
            Pattern::Simple => "simple",
            Pattern::Complex => "complex",
            Pattern::Other(other) => other,
        }
    }

    /// Whether the task takes the planner, supervisor and judge.
    pub fn is_complex(&self) -> bool {
        matches!(self, Pattern::Complex)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Pattern::normalize(&raw))
    }
}

/// How the worker stage runs the assigned agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One agent handles the whole task.
    #[default]
    Delegated,
    /// Assigned agents run one after another, each seeing the previous result.
    Sequential,
    /// Assigned agents run at once.
    Parallel,
}

impl ExecutionMode {
    fn parse(raw: &str) -> ExecutionMode {
        match raw.trim().to_lowercase().as_str() {
            "sequential" => ExecutionMode::Sequential,
            "parallel" => ExecutionMode::Parallel,
            _ => ExecutionMode::Delegated,
        }
    }
}

/// Output of the router. Created once per task, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// How much of the graph to run.
    pub pattern: Pattern,
    /// Team whose agents and tools the run is scoped to.
    pub target_team: String,
    /// Agents picked from the team. Empty means the first member.
    #[serde(default)]
    pub assigned_to: Vec<String>,
    /// How assigned agents share the work.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Optional split of the task, one per assigned agent.
    #[serde(default)]
    pub subtasks: Vec<String>,
    /// Router's explanation.
    #[serde(default)]
    pub reasoning: String,
}

impl RoutingDecision {
    /// The safe default: `simple` on the `default` team.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            pattern: Pattern::Simple,
            target_team: DEFAULT_TEAM.to_string(),
            assigned_to: Vec::new(),
            execution_mode: ExecutionMode::Delegated,
            subtasks: Vec::new(),
            reasoning: reason.into(),
        }
    }

    /// Extract a decision from router output.
    ///
    /// Structured JSON (possibly wrapped in prose or a code fence) wins; the
    /// phrase `routing to <pattern>` is a last resort.
    pub fn parse(output: &str) -> Option<RoutingDecision> {
        if let Some(decision) = extract_json(output).and_then(|v| from_json(&v)) {
            return Some(decision);
        }
        let captures = ROUTING_TO.as_ref()?.captures(output)?;
        let mut decision = RoutingDecision::fallback("Extracted from free-text router output");
        decision.pattern = Pattern::normalize(captures.get(1)?.as_str());
        Some(decision)
    }
}

static ROUTING_TO: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)routing to\s+([a-z_]+)").ok());

/// The JSON object spanning the first `{` to the last `}`.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn from_json(value: &Value) -> Option<RoutingDecision> {
    let obj = value.as_object()?;
    let raw_pattern = ["pattern", "routing_pattern", "route"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))?;
    let strings = |key: &str| -> Vec<String> {
        obj.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };
    let target_team = ["target_team", "team"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TEAM);

    Some(RoutingDecision {
        pattern: Pattern::normalize(raw_pattern),
        target_team: target_team.to_string(),
        assigned_to: strings("assigned_to"),
        execution_mode: obj
            .get("execution_mode")
            .and_then(Value::as_str)
            .map(ExecutionMode::parse)
            .unwrap_or_default(),
        subtasks: strings("subtasks"),
        reasoning: obj
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Asks the router agent how to handle a task. Never fails.
pub struct Router {
    agent: Arc<dyn Agent>,
    teams: Vec<TeamConfig>,
    agents: Vec<AgentDescriptor>,
}

impl Router {
    /// A router asking `agent`, describing `teams` and `agents` in its prompt.
    pub fn new(agent: Arc<dyn Agent>, teams: Vec<TeamConfig>, agents: Vec<AgentDescriptor>) -> Self {
        Self {
            agent,
            teams,
            agents,
        }
    }

    fn instructions(&self) -> String {
        let mut out = String::from(
            "Classify the task and choose who handles it. Reply with JSON only:\n\
             {\"pattern\": \"direct|simple|complex\", \"target_team\": \"<team>\", \
             \"assigned_to\": [\"<agent>\"], \"execution_mode\": \"delegated|sequential|parallel\", \
             \"subtasks\": [\"...\"], \"reasoning\": \"...\"}\n\
             direct: answer from knowledge. simple: one agent with tools. complex: needs a plan and several agents.\n",
        );
        if !self.teams.is_empty() {
            out.push_str("\nTeams:\n");
            for team in &self.teams {
                out.push_str(&format!(
                    "- {} ({}): {}\n",
                    team.name,
                    team.members.join(", "),
                    team.description
                ));
            }
        }
        out.push_str("\nAgents:\n");
        for agent in self.agents.iter().filter(|a| a.role.is_participant()) {
            out.push_str(&format!("- {} [{}]: {}\n", agent.name, agent.role, agent.description));
        }
        out
    }

    /// Route a task. Any failure yields [`RoutingDecision::fallback`] with the
    /// cause recorded in `reasoning`.
    pub async fn route(
        &self,
        task: &Task,
        ctx: &RunContext,
        history: &[Message],
        sink: &EventSink,
    ) -> RoutingDecision {
        let mut prompt = task.text.clone();
        if let Some(hint) = task.history_hint() {
            prompt = format!("{prompt}\n\nConversation so far: {hint}");
        }
        if !ctx.tools.is_empty() {
            prompt = format!("{prompt}\n\nAvailable tools: {}", ctx.tools.join(", "));
        }
        let input = AgentInput::new(prompt)
            .with_instructions(self.instructions())
            .with_history(history.to_vec());

        let decision = match stream_agent(self.agent.as_ref(), input, sink, Visibility::ReasoningOnly)
            .await
        {
            Ok(output) => RoutingDecision::parse(&output.text).unwrap_or_else(|| {
                warn!(workflow_id = %ctx.workflow_id, "Router output had no routing decision");
                RoutingDecision::fallback(format!(
                    "Router output could not be parsed: {}",
                    truncate(&output.text, 200)
                ))
            }),
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "Router agent failed");
                RoutingDecision::fallback(format!("Router agent failed: {e}"))
            }
        };

        info!(
            workflow_id = %ctx.workflow_id,
            pattern = %decision.pattern,
            team = %decision.target_team,
            mode = ?decision.execution_mode,
            "Routing decision"
        );
        decision
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_agent::{AgentRole, ScriptedAgent};

    fn router(agent: ScriptedAgent) -> Router {
        Router::new(
            Arc::new(agent),
            vec![],
            vec![AgentDescriptor::new("worker", AgentRole::Worker)],
        )
    }

    #[test]
    fn test_synonyms_normalize() {
        assert_eq!(Pattern::normalize("complex_council"), Pattern::Complex);
        assert_eq!(Pattern::normalize(" Direct_Answer "), Pattern::Direct);
        assert_eq!(Pattern::normalize("SIMPLE_TOOL"), Pattern::Simple);
        assert_eq!(Pattern::normalize(""), Pattern::Simple);
        assert_eq!(
            Pattern::normalize("Swarm"),
            Pattern::Other("swarm".to_string())
        );
        assert!(!Pattern::normalize("swarm").is_complex());
    }

    #[test]
    fn test_parse_structured_output() {
        let decision = RoutingDecision::parse(
            "Sure! ```json\n{\"pattern\":\"complex_council\",\"target_team\":\"research\",\
             \"assigned_to\":[\"researcher\",\"analyst\"],\"execution_mode\":\"PARALLEL\",\
             \"subtasks\":[\"a\",\"b\"]}\n```",
        )
        .unwrap();
        assert_eq!(decision.pattern, Pattern::Complex);
        assert_eq!(decision.target_team, "research");
        assert_eq!(decision.assigned_to, vec!["researcher", "analyst"]);
        assert_eq!(decision.execution_mode, ExecutionMode::Parallel);
        assert_eq!(decision.subtasks.len(), 2);
    }

    #[test]
    fn test_parse_free_text_fallback() {
        let decision = RoutingDecision::parse("I think we are Routing to Complex now").unwrap();
        assert_eq!(decision.pattern, Pattern::Complex);
        assert_eq!(decision.target_team, DEFAULT_TEAM);
        assert!(RoutingDecision::parse("no idea").is_none());
        assert!(RoutingDecision::parse("{\"team\": \"x\"}").is_none());
    }

    #[test]
    fn test_pattern_serde_normalizes() {
        let d: RoutingDecision =
            serde_json::from_str(r#"{"pattern":"direct_answer","target_team":"t"}"#).unwrap();
        assert_eq!(d.pattern, Pattern::Direct);
        assert_eq!(serde_json::to_value(&d).unwrap()["pattern"], "direct");
    }

    #[tokio::test]
    async fn test_route_is_deterministic() {
        let output = r#"{"pattern":"complex_council","target_team":"research"}"#;
        let r = router(ScriptedAgent::replies("router", vec![output]));
        let task = Task::new("Compare three databases");
        let ctx = RunContext::new();
        let first = r.route(&task, &ctx, &[], &EventSink::discard()).await;
        let second = r.route(&task, &ctx, &[], &EventSink::discard()).await;
        assert_eq!(first, second);
        assert_eq!(first.pattern, Pattern::Complex);
        assert_eq!(first.target_team, "research");
    }

    #[tokio::test]
    async fn test_route_defaults_safely_on_agent_failure() {
        let r = router(ScriptedAgent::failing("router", "connection refused"));
        let decision = r
            .route(
                &Task::new("x"),
                &RunContext::new(),
                &[],
                &EventSink::discard(),
            )
            .await;
        assert_eq!(decision.pattern, Pattern::Simple);
        assert_eq!(decision.target_team, "default");
        assert!(decision.reasoning.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_route_defaults_on_garbage() {
        let r = router(ScriptedAgent::replies("router", vec!["¯\\_(ツ)_/¯"]));
        let decision = r
            .route(
                &Task::new("x"),
                &RunContext::new(),
                &[],
                &EventSink::discard(),
            )
            .await;
        assert_eq!(decision.pattern, Pattern::Simple);
        assert_eq!(decision.target_team, DEFAULT_TEAM);
        assert!(decision.reasoning.contains("could not be parsed"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 5), "hi");
    }
}
