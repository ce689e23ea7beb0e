use crate::agent::Agent;
use crate::backends::openai::OpenAiAgent;
use crate::backends::scripted::ScriptedAgent;
use crate::config::{AgentConfig, AgentProvider, AgentRole};
use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// What the router and the progress ledger know about an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent name.
    pub name: String,
    /// Graph role.
    pub role: AgentRole,
    /// Capability summary.
    #[serde(default)]
    pub description: String,
    /// Invocations need approval.
    #[serde(default)]
    pub side_effecting: bool,
}

impl AgentDescriptor {
    /// A descriptor with no description.
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            description: String::new(),
            side_effecting: false,
        }
    }

    /// Set the capability summary.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the agent as side-effecting.
    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }
}

impl From<&AgentConfig> for AgentDescriptor {
    fn from(config: &AgentConfig) -> Self {
        Self {
            name: config.name.clone(),
            role: config.role,
            description: config.description.clone(),
            side_effecting: config.side_effecting,
        }
    }
}

/// Create an agent from its configuration.
pub fn build_agent(config: &AgentConfig) -> Arc<dyn Agent> {
    match config.provider {
        AgentProvider::OpenAi => Arc::new(OpenAiAgent::new(config.clone())),
        AgentProvider::Scripted => Arc::new(ScriptedAgent::replies(
            config.name.clone(),
            config.responses.clone(),
        )),
    }
}

/// Named agents available to a workflow, in registration order.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, (AgentDescriptor, Arc<dyn Agent>)>,
    order: Vec<String>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from agent configs. Names must be unique.
    pub fn from_configs(configs: &[AgentConfig]) -> FleetResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            if registry.agents.contains_key(&config.name) {
                return Err(FleetError::Configuration(format!(
                    "Duplicate agent name '{}'",
                    config.name
                )));
            }
            registry.register(AgentDescriptor::from(config), build_agent(config));
        }
        info!(count = registry.len(), "Agent registry built");
        Ok(registry)
    }

    /// Register an agent, replacing any previous agent with the same name.
    pub fn register(&mut self, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) {
        if !self.agents.contains_key(&descriptor.name) {
            self.order.push(descriptor.name.clone());
        }
        self.agents
            .insert(descriptor.name.clone(), (descriptor, agent));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        self.register(descriptor, agent);
        self
    }

    /// Agent registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).map(|(_, a)| a.clone())
    }

    /// Like [`get`](Self::get) but a missing agent is a configuration error.
    pub fn require(&self, name: &str) -> FleetResult<Arc<dyn Agent>> {
        self.get(name)
            .ok_or_else(|| FleetError::Configuration(format!("No agent named '{name}'")))
    }

    /// Descriptor registered under `name`.
    pub fn descriptor(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.get(name).map(|(d, _)| d)
    }

    /// Every descriptor, in registration order.
    pub fn descriptors(&self) -> Vec<&AgentDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.descriptor(name))
            .collect()
    }

    /// First registered agent with the given role.
    pub fn by_role(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.order
            .iter()
            .filter_map(|name| self.agents.get(name))
            .find(|(d, _)| d.role == role)
            .map(|(_, a)| a.clone())
    }

    /// Agents eligible to speak in a round, in registration order.
    pub fn participants(&self) -> Vec<&AgentDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| d.role.is_participant())
            .collect()
    }

    /// Every agent name, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.order)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::AgentInput;

    fn configs() -> Vec<AgentConfig> {
        vec![
            AgentConfig::scripted("router", AgentRole::Router, vec!["{}".into()]),
            AgentConfig::scripted("researcher", AgentRole::Researcher, vec!["found".into()]),
            AgentConfig::scripted("coder", AgentRole::Coder, vec!["done".into()]),
            AgentConfig::scripted("judge", AgentRole::Judge, vec!["ok".into()]),
        ]
    }

    #[tokio::test]
    async fn test_from_configs_builds_scripted_agents() {
        let registry = AgentRegistry::from_configs(&configs()).unwrap();
        assert_eq!(registry.len(), 4);
        let coder = registry.require("coder").unwrap();
        let out = coder.invoke(AgentInput::new("x")).await.unwrap();
        assert_eq!(out.text, "done");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut cfgs = configs();
        cfgs.push(AgentConfig::scripted("coder", AgentRole::Coder, vec![]));
        let err = AgentRegistry::from_configs(&cfgs).unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }

    #[test]
    fn test_participants_exclude_control_roles() {
        let registry = AgentRegistry::from_configs(&configs()).unwrap();
        let names: Vec<_> = registry
            .participants()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["researcher", "coder"]);
        assert_eq!(registry.by_role(AgentRole::Judge).unwrap().name(), "judge");
        assert!(registry.require("missing").is_err());
    }
}
