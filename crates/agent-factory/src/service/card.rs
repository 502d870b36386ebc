use serde::Serialize;

use crate::config::{AgentCardConfig, SkillConfig};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl From<&SkillConfig> for AgentSkill {
    fn from(s: &SkillConfig) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            description: s.description.clone(),
            tags: s.tags.clone(),
            examples: s.examples.clone(),
        }
    }
}

/// Discovery document served at `<prefix>/.well-known/agent.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
}

impl AgentCard {
    /// `fallback_url` is used when the config does not pin a public URL.
    pub fn from_config(cfg: &AgentCardConfig, fallback_url: String) -> Self {
        Self {
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            url: cfg.url.clone().unwrap_or(fallback_url),
            version: cfg.version.clone(),
            capabilities: AgentCapabilities {
                streaming: true,
                push_notifications: false,
            },
            default_input_modes: cfg.default_input_modes.clone(),
            default_output_modes: cfg.default_output_modes.clone(),
            skills: cfg.skills.iter().map(AgentSkill::from).collect(),
        }
    }
}
