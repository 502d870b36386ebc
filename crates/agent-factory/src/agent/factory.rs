//! Builds every configured agent once and hands out shared instances.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{info, warn};

use super::chat_agent::Agent;
use crate::config::{AgentFactoryConfig, McpFailureStrategy};
use crate::error::{ConfigError, ConnectionError, EntityKind, FactoryError};
use crate::mcp::{McpProvider, ToolDescriptor};
use crate::model::{ChatClient, ChatClientFactory, ModelRegistry};

pub struct AgentFactory {
    agents: IndexMap<String, Arc<Agent>>,
    provider: Arc<McpProvider>,
}

impl std::fmt::Debug for AgentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFactory")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AgentFactory {
    /// Refresh health for the servers agents reference, then build one agent
    /// per config entry with the tools of its healthy servers.
    ///
    /// Under the strict policy a referenced server that fails its health
    /// check is an error; under the lenient policy its tools are left out.
    pub async fn build(
        config: &AgentFactoryConfig,
        registry: &ModelRegistry,
        clients: &dyn ChatClientFactory,
        provider: Arc<McpProvider>,
    ) -> Result<Self, FactoryError> {
        let mut referenced: Vec<String> = Vec::new();
        for agent in config.agents.values() {
            for server in &agent.mcp_servers {
                if !referenced.contains(server) {
                    referenced.push(server.clone());
                }
            }
        }
        provider.refresh_health(&referenced).await;

        let mut model_clients: HashMap<String, Arc<dyn ChatClient>> = HashMap::new();
        let mut agents = IndexMap::new();
        for (name, cfg) in &config.agents {
            let model_key = registry.resolve(cfg)?.to_string();
            let client = match model_clients.get(&model_key) {
                Some(c) => c.clone(),
                None => {
                    let model = registry
                        .get(&model_key)
                        .ok_or_else(|| FactoryError::not_found(EntityKind::Model, &model_key))?;
                    let c = clients.create(&model_key, model)?;
                    model_clients.insert(model_key.clone(), c.clone());
                    c
                }
            };

            let mut tools: Vec<ToolDescriptor> = Vec::new();
            for server in &cfg.mcp_servers {
                match provider.health(server) {
                    Some(h) if h.is_healthy() => tools.extend(provider.tools(server)),
                    other => {
                        let reason = other
                            .map(|h| h.label().to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        if provider.policy() == McpFailureStrategy::Strict {
                            return Err(ConnectionError::Unavailable {
                                server: server.clone(),
                            }
                            .into());
                        }
                        warn!(agent = %name, server = %server, %reason, "skipping tools of unavailable server");
                    }
                }
            }

            let mut seen: HashMap<&str, &str> = HashMap::new();
            for tool in &tools {
                if let Some(first) = seen.insert(&tool.exposed_name, &tool.server) {
                    return Err(ConfigError::single(
                        format!("agent_factory.agents.{name}.mcp_servers"),
                        format!(
                            "tool name '{}' is exposed by both '{first}' and '{}'",
                            tool.exposed_name, tool.server
                        ),
                    )
                    .into());
                }
            }

            info!(agent = %name, model = %model_key, tools = tools.len(), "agent ready");
            let agent = Agent::new(
                name.clone(),
                cfg.instructions.clone(),
                model_key,
                cfg.model_settings.clone().unwrap_or_default(),
                client,
                tools,
                provider.clone(),
            );
            agents.insert(name.clone(), Arc::new(agent));
        }

        Ok(Self { agents, provider })
    }

    /// The shared instance built for `name`.
    pub fn get_agent(&self, name: &str) -> Result<Arc<Agent>, FactoryError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| FactoryError::not_found(EntityKind::Agent, name))
    }

    /// Agent names in declaration order.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn model_id(&self, name: &str) -> Result<String, FactoryError> {
        self.get_agent(name).map(|a| a.model_id().to_string())
    }

    pub fn response_format(&self, name: &str) -> Result<Option<Value>, FactoryError> {
        self.get_agent(name).map(|a| a.response_format())
    }

    pub fn provider(&self) -> &Arc<McpProvider> {
        &self.provider
    }
}
