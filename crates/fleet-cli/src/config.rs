use fleet_agent::AgentConfig;
use fleet_orchestrator::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Everything `fleet.toml` can hold.
#[derive(Debug, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Keep conversations, history and checkpoints under `data_dir` instead of in memory.
    #[serde(default = "default_persist")]
    pub persist: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds active runs get to finish on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_persist() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_shutdown_grace() -> u64 {
    10
}

impl FleetConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut config: FleetConfig = toml::from_str(raw)?;
        if config.agents.is_empty() {
            anyhow::bail!("No agents configured; add at least one [[agents]] table");
        }
        if config.persist && config.engine.checkpoint.dir.is_none() {
            config.engine.checkpoint.dir = Some(config.data_dir.join("checkpoints"));
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_agent::{AgentProvider, AgentRole};
    use fleet_orchestrator::ApprovalMode;

    const EXAMPLE: &str = include_str!("../../../fleet.example.toml");

    #[test]
    fn test_example_config_parses() {
        let config = FleetConfig::parse(EXAMPLE).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.engine.supervisor.max_stalls, 3);
        assert_eq!(config.engine.approval.mode, ApprovalMode::Disabled);
        assert!(config.agents.iter().any(|a| a.role == AgentRole::Router));
        assert!(config.agents.iter().any(|a| a.role == AgentRole::Planner));
        assert_eq!(config.engine.teams[0].name, "research");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FleetConfig::parse(
            r#"
            persist = false

            [[agents]]
            name = "worker"
            provider = "scripted"
            responses = ["hi"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.engine.supervisor.max_rounds, 10);
        assert!(config.engine.checkpoint.dir.is_none());
        assert_eq!(config.agents[0].role, AgentRole::Worker);
        assert_eq!(config.agents[0].provider, AgentProvider::Scripted);
        assert_eq!(config.engine.approval.mode, ApprovalMode::Required);
    }

    #[test]
    fn test_persist_puts_checkpoints_under_data_dir() {
        let config = FleetConfig::parse(
            r#"
            data_dir = "/var/lib/fleet"

            [[agents]]
            name = "worker"
            provider = "scripted"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.engine.checkpoint.dir,
            Some(PathBuf::from("/var/lib/fleet/checkpoints"))
        );
    }

    #[test]
    fn test_no_agents_is_an_error() {
        let err = FleetConfig::parse("persist = false").unwrap_err();
        assert!(err.to_string().contains("No agents"));
    }

    #[tokio::test]
    async fn test_load_reports_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FleetConfig::load(&tmp.path().join("missing.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
