use fleet_agent::{AgentRegistry, AgentRole};
use fleet_core::{FleetError, FleetResult};
use fleet_session::SessionConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the engine needs, constructed once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fast-path gate.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Round and stall limits for complex runs.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Worker fan-out.
    #[serde(default)]
    pub graph: GraphConfig,
    /// Checkpoint persistence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Concurrency limits.
    #[serde(default)]
    pub session: SessionConfig,
    /// Approval gate. Required unless configured otherwise.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Background quality scoring.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    /// Which agent plays each control role.
    #[serde(default)]
    pub roles: RoleBindings,
    /// Teams the router can target.
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
}

/// Fast-path classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Messages longer than this (in characters) never take the fast path.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Short replies such as "ok" or "thanks" that always take the fast path.
    #[serde(default = "default_acknowledgments")]
    pub acknowledgments: Vec<String>,
    /// Any match sends the message to the full engine.
    #[serde(default = "default_complexity_patterns")]
    pub complexity_patterns: Vec<String>,
}

fn default_max_length() -> usize {
    100
}

fn default_acknowledgments() -> Vec<String> {
    [
        "ok", "okay", "k", "thanks", "thank you", "thx", "ty", "continue", "go on", "go ahead",
        "yes", "no", "sure", "got it", "cool", "great", "nice", "perfect", "hi", "hello", "hey",
        "bye",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_complexity_patterns() -> Vec<String> {
    [
        r"(?i)\b(code|implement|build|debug|fix|refactor|analy[sz]e|compare|research|design|optimi[sz]e|deploy|calculate|benchmark)\b",
        r"(?i)\b(step[- ]by[- ]step|and then|after that|followed by|multi[- ]step)\b",
        r"(?i)\bfirst\b.*\bthen\b",
        r"(?i)\b(write|create|generate)\b.*\b(program|script|function|report|essay|plan)\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            acknowledgments: default_acknowledgments(),
            complexity_patterns: default_complexity_patterns(),
        }
    }
}

/// Limits for the round and stall state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Hard cap on rounds per run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Stalled rounds tolerated before the plan is reset.
    #[serde(default = "default_max_stalls")]
    pub max_stalls: u32,
    /// How many times the plan may be redone after hitting `max_stalls`.
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
    /// Agent failures in a row before the run fails.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Save a checkpoint every N rounds. 0 disables round checkpoints.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
    /// How many recent observations the progress ledger sees.
    #[serde(default = "default_observation_window")]
    pub observation_window: usize,
}

fn default_max_rounds() -> u32 {
    10
}

fn default_max_stalls() -> u32 {
    3
}

fn default_max_resets() -> u32 {
    2
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_checkpoint_every() -> u32 {
    1
}

fn default_observation_window() -> usize {
    6
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_stalls: default_max_stalls(),
            max_resets: default_max_resets(),
            max_consecutive_failures: default_max_consecutive_failures(),
            checkpoint_every: default_checkpoint_every(),
            observation_window: default_observation_window(),
        }
    }
}

/// Workflow graph settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// When false, `parallel` routing decisions run sequentially.
    #[serde(default = "default_true")]
    pub allow_parallel: bool,
    /// Upper bound on agents invoked at once in parallel mode.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    4
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            allow_parallel: true,
            max_parallel: default_max_parallel(),
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save checkpoints at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for checkpoint files. In-memory when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// How side-effecting agent calls are guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// No gate: side-effecting agents run unguarded. Must be set explicitly.
    Disabled,
    /// Every request is approved without asking anyone.
    Auto,
    /// An approval handler must be supplied when the engine is built.
    #[default]
    Required,
}

/// Approval gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Defaults to [`ApprovalMode::Required`].
    #[serde(default)]
    pub mode: ApprovalMode,
    /// How long an interactive handler waits before treating silence as rejection.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

fn default_approval_timeout() -> u64 {
    300
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Required,
            timeout_secs: default_approval_timeout(),
        }
    }
}

/// Background quality scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Score finished runs in the background.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ask the judge agent for the score instead of the heuristic scorer.
    #[serde(default)]
    pub use_judge: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_judge: false,
        }
    }
}

/// Which registered agent plays each control role. Unset bindings fall back
/// to the first agent registered with the matching [`AgentRole`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleBindings {
    /// Agent that routes tasks.
    #[serde(default)]
    pub router: Option<String>,
    /// Agent that plans and keeps the progress ledger.
    #[serde(default)]
    pub planner: Option<String>,
    /// Agent that reviews complex answers.
    #[serde(default)]
    pub judge: Option<String>,
    /// Agent answering fast-path turns. Defaults to the first worker.
    #[serde(default)]
    pub fast_path: Option<String>,
}

/// A named group of agents the router can target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Name the router targets.
    pub name: String,
    /// Shown to the router.
    #[serde(default)]
    pub description: String,
    /// Agent names in the team.
    pub members: Vec<String>,
    /// Tool names the team is scoped to.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl EngineConfig {
    /// Team configured under `name`.
    pub fn team(&self, name: &str) -> Option<&TeamConfig> {
        self.teams.iter().find(|t| t.name == name)
    }

    /// Check the config against the agents that will serve it.
    pub fn validate(&self, registry: &AgentRegistry) -> FleetResult<()> {
        if self.supervisor.max_rounds == 0 {
            return Err(FleetError::Configuration(
                "supervisor.max_rounds must be at least 1".into(),
            ));
        }
        if self.supervisor.max_stalls == 0 {
            return Err(FleetError::Configuration(
                "supervisor.max_stalls must be at least 1".into(),
            ));
        }
        if self.supervisor.max_consecutive_failures == 0 {
            return Err(FleetError::Configuration(
                "supervisor.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.session.max_concurrent_workflows == 0 {
            return Err(FleetError::Configuration(
                "session.max_concurrent_workflows must be at least 1".into(),
            ));
        }
        for pattern in &self.classifier.complexity_patterns {
            Regex::new(pattern).map_err(|e| {
                FleetError::Configuration(format!("Invalid complexity pattern '{pattern}': {e}"))
            })?;
        }

        for (binding, role) in [
            (&self.roles.router, AgentRole::Router),
            (&self.roles.planner, AgentRole::Planner),
        ] {
            let found = match binding {
                Some(name) => registry.get(name).is_some(),
                None => registry.by_role(role).is_some(),
            };
            if !found {
                return Err(FleetError::Configuration(format!(
                    "No agent available for the {role} role"
                )));
            }
        }
        for name in [&self.roles.judge, &self.roles.fast_path].into_iter().flatten() {
            registry.require(name)?;
        }
        if registry.participants().is_empty() {
            return Err(FleetError::Configuration(
                "At least one worker agent is required".into(),
            ));
        }
        for team in &self.teams {
            for member in &team.members {
                if registry.get(member).is_none() {
                    return Err(FleetError::Configuration(format!(
                        "Team '{}' references unknown agent '{member}'",
                        team.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_agent::AgentConfig;

    fn registry() -> AgentRegistry {
        AgentRegistry::from_configs(&[
            AgentConfig::scripted("router", AgentRole::Router, vec![]),
            AgentConfig::scripted("planner", AgentRole::Planner, vec![]),
            AgentConfig::scripted("worker", AgentRole::Worker, vec![]),
        ])
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.supervisor.max_rounds, 10);
        assert_eq!(config.supervisor.max_stalls, 3);
        assert_eq!(config.classifier.max_length, 100);
        assert_eq!(config.approval.mode, ApprovalMode::Required);
        config.validate(&registry()).unwrap();
    }

    #[test]
    fn test_missing_approval_section_keeps_gate_required() {
        let config: EngineConfig = toml::from_str("[supervisor]\nmax_rounds = 4\n").unwrap();
        assert_eq!(config.supervisor.max_rounds, 4);
        assert_eq!(config.approval.mode, ApprovalMode::Required);

        let config: EngineConfig = toml::from_str("[approval]\ntimeout_secs = 5\n").unwrap();
        assert_eq!(config.approval.mode, ApprovalMode::Required);
        assert_eq!(config.approval.timeout_secs, 5);

        let config: EngineConfig = toml::from_str("[approval]\nmode = \"disabled\"\n").unwrap();
        assert_eq!(config.approval.mode, ApprovalMode::Disabled);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = EngineConfig::default();
        config.supervisor.max_rounds = 0;
        assert!(config.validate(&registry()).is_err());

        let mut config = EngineConfig::default();
        config.session.max_concurrent_workflows = 0;
        assert!(config.validate(&registry()).is_err());
    }

    #[test]
    fn test_bad_regex_rejected() {
        let mut config = EngineConfig::default();
        config.classifier.complexity_patterns.push("(unclosed".into());
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn test_missing_roles_and_team_members_rejected() {
        let registry = AgentRegistry::from_configs(&[AgentConfig::scripted(
            "worker",
            AgentRole::Worker,
            vec![],
        )])
        .unwrap();
        assert!(EngineConfig::default().validate(&registry).is_err());

        let mut config = EngineConfig::default();
        config.teams.push(TeamConfig {
            name: "research".into(),
            description: String::new(),
            members: vec!["ghost".into()],
            tools: vec![],
        });
        assert!(config.validate(&self::registry()).is_err());
    }
}
