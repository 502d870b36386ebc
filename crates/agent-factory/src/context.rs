//! The application context: owns the tool-server provider and the agent
//! factory for the lifetime of one command.

use std::sync::Arc;

use tracing::info;

use crate::agent::AgentFactory;
use crate::config::{AppConfig, EnvSource};
use crate::error::FactoryError;
use crate::mcp::{DefaultConnector, McpConnector, McpProvider};
use crate::model::{ChatClientFactory, ModelRegistry, OpenAiClientFactory};

pub struct AppContext {
    config: AppConfig,
    registry: ModelRegistry,
    provider: Arc<McpProvider>,
    factory: AgentFactory,
}

impl AppContext {
    /// Connect tool servers and build every agent. If building fails after
    /// servers were opened, they are closed before the error is returned.
    pub async fn start(
        config: AppConfig,
        connector: Arc<dyn McpConnector>,
        clients: &dyn ChatClientFactory,
    ) -> Result<Self, FactoryError> {
        let af = &config.agent_factory;
        let registry = ModelRegistry::new(af.openai_models.clone(), af.model_selection);
        let provider = Arc::new(McpProvider::start(&af.mcp, connector).await?);
        let factory = match AgentFactory::build(af, &registry, clients, provider.clone()).await {
            Ok(f) => f,
            Err(e) => {
                provider.shutdown().await;
                return Err(e);
            }
        };
        info!(
            agents = factory.agent_names().len(),
            servers = provider.available_servers().len(),
            "context ready"
        );
        Ok(Self {
            config,
            registry,
            provider,
            factory,
        })
    }

    /// [`start`](Self::start) with the real transports and model client.
    pub async fn start_default(
        config: AppConfig,
        env: Arc<dyn EnvSource>,
    ) -> Result<Self, FactoryError> {
        let connector = Arc::new(DefaultConnector::new(env));
        Self::start(config, connector, &OpenAiClientFactory::new()).await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<McpProvider> {
        &self.provider
    }

    pub fn factory(&self) -> &AgentFactory {
        &self.factory
    }

    /// Close every tool-server connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.provider.shutdown().await;
    }
}
