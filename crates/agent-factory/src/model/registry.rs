//! Declared model deployments and the selection policy.

use indexmap::IndexMap;

use crate::config::{AgentConfig, ModelConfig, ModelSelectStrategy};
use crate::error::{EntityKind, FactoryError};

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelConfig>,
    policy: ModelSelectStrategy,
}

impl ModelRegistry {
    pub fn new(models: IndexMap<String, ModelConfig>, policy: ModelSelectStrategy) -> Self {
        Self { models, policy }
    }

    pub fn policy(&self) -> ModelSelectStrategy {
        self.policy
    }

    pub fn get(&self, key: &str) -> Option<&ModelConfig> {
        self.models.get(key)
    }

    /// Key chosen by the policy, `None` when no models are declared.
    pub fn select(&self) -> Option<&str> {
        select_model(&self.models, self.policy)
    }

    /// The agent's pinned model, otherwise the policy's choice.
    pub fn resolve(&self, agent: &AgentConfig) -> Result<&str, FactoryError> {
        match &agent.model {
            Some(key) => self
                .models
                .get_key_value(key)
                .map(|(k, _)| k.as_str())
                .ok_or_else(|| FactoryError::not_found(EntityKind::Model, key.clone())),
            None => self
                .select()
                .ok_or_else(|| FactoryError::not_found(EntityKind::Model, "<any>")),
        }
    }
}

/// Deterministic choice over static tags. Untagged entries rank after tagged
/// ones and ties keep declaration order.
pub fn select_model(
    models: &IndexMap<String, ModelConfig>,
    policy: ModelSelectStrategy,
) -> Option<&str> {
    let rank = |m: &ModelConfig| -> (bool, i64) {
        let tag = match policy {
            ModelSelectStrategy::First => return (false, 0),
            ModelSelectStrategy::Cost => m.cost.map(i64::from),
            ModelSelectStrategy::Latency => m.latency.map(i64::from),
            ModelSelectStrategy::Quality => m.quality.map(|q| -i64::from(q)),
        };
        match tag {
            Some(v) => (false, v),
            None => (true, 0),
        }
    };
    // min_by_key returns the first minimum, which preserves declaration order.
    models
        .iter()
        .min_by_key(|(_, m)| rank(m))
        .map(|(k, _)| k.as_str())
}
