use serde::{Deserialize, Serialize};

/// Role of each agent in the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Classifies the task and selects the execution pattern and team.
    Router,
    /// Produces and refreshes the action plan; also keeps the progress ledger.
    Planner,
    /// General-purpose executor.
    Worker,
    /// Scores and optionally refines the final answer.
    Judge,
    /// Looks things up and reports findings.
    Researcher,
    /// Writes and runs code.
    Coder,
    /// Works through data and numbers.
    Analyst,
}

impl AgentRole {
    /// Roles that can be chosen as the next speaker in a round.
    pub fn is_participant(self) -> bool {
        !matches!(self, AgentRole::Router | AgentRole::Planner | AgentRole::Judge)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Router => write!(f, "router"),
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Worker => write!(f, "worker"),
            AgentRole::Judge => write!(f, "judge"),
            AgentRole::Researcher => write!(f, "researcher"),
            AgentRole::Coder => write!(f, "coder"),
            AgentRole::Analyst => write!(f, "analyst"),
        }
    }
}

/// Backend that serves an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProvider {
    /// Any OpenAI-compatible chat completions endpoint.
    OpenAi,
    /// Replays fixed responses. For offline runs and tests.
    Scripted,
}

/// Configuration for one named agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique name the registry and router use.
    pub name: String,
    /// Defaults to `worker`.
    #[serde(default = "default_role")]
    pub role: AgentRole,
    /// Backend to build.
    pub provider: AgentProvider,
    /// Model name sent to the provider.
    #[serde(default)]
    pub model_id: String,
    /// Inline API key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: String,
    /// Read the API key from this environment variable when `api_key` is empty.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Defaults to `https://api.openai.com`.
    pub api_base_url: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// System instructions sent with every invocation.
    #[serde(default)]
    pub instructions: String,
    /// Capability summary shown to the router and the progress ledger.
    #[serde(default)]
    pub description: String,
    /// Invocations of this agent go through the approval gate.
    #[serde(default)]
    pub side_effecting: bool,
    /// Replies for the scripted provider.
    #[serde(default)]
    pub responses: Vec<String>,
}

fn default_role() -> AgentRole {
    AgentRole::Worker
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl AgentConfig {
    /// Provider base URL.
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
    }

    /// `api_key`, or the value of `api_key_env`. Empty when neither is set.
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }

    /// A scripted agent config, convenient for tests and demos.
    pub fn scripted(name: impl Into<String>, role: AgentRole, responses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            role,
            provider: AgentProvider::Scripted,
            model_id: String::new(),
            api_key: String::new(),
            api_key_env: None,
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            instructions: String::new(),
            description: String::new(),
            side_effecting: false,
            responses,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display_and_participants() {
        assert_eq!(AgentRole::Judge.to_string(), "judge");
        assert!(AgentRole::Coder.is_participant());
        assert!(!AgentRole::Planner.is_participant());
    }

    #[test]
    fn test_config_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"name":"w","provider":"openai","api_base_url":null}"#)
                .unwrap();
        assert_eq!(config.role, AgentRole::Worker);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.base_url(), "https://api.openai.com");
        assert!(!config.side_effecting);
    }
}
