//! Validated configuration graph.
//!
//! These types are produced by [`crate::config::load`] after interpolation,
//! environment overrides and validation. They are never mutated afterwards.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

pub const DEFAULT_API_VERSION: &str = "2024-06-01";
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HISTORY_THRESHOLD: usize = 1000;
pub const DEFAULT_HISTORY_TARGET: usize = 10;

/// Root of a configuration file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent_factory: AgentFactoryConfig,
    pub service_factory: Option<ServiceFactoryConfig>,
    pub chat_history: ChatHistorySettings,
}

#[derive(Debug, Clone)]
pub struct AgentFactoryConfig {
    /// Agents keyed by name, in declaration order.
    pub agents: IndexMap<String, AgentConfig>,
    /// Model deployments keyed by service id, in declaration order.
    pub openai_models: IndexMap<String, ModelConfig>,
    pub mcp: McpConfig,
    pub model_selection: ModelSelectStrategy,
}

/// Policy used when an agent does not pin a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelectStrategy {
    #[default]
    First,
    Cost,
    Latency,
    Quality,
}

impl FromStr for ModelSelectStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "cost" => Ok(Self::Cost),
            "latency" => Ok(Self::Latency),
            "quality" => Ok(Self::Quality),
            other => Err(format!(
                "unknown model selection '{other}' (expected first|cost|latency|quality)"
            )),
        }
    }
}

impl fmt::Display for ModelSelectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::First => "first",
            Self::Cost => "cost",
            Self::Latency => "latency",
            Self::Quality => "quality",
        };
        f.write_str(s)
    }
}

/// What happens when a tool server cannot be reached at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpFailureStrategy {
    /// Any failure aborts provider startup.
    Strict,
    /// Failed servers are marked unavailable and excluded from tool lists.
    #[default]
    Lenient,
}

impl FromStr for McpFailureStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!(
                "unknown mcp failure strategy '{other}' (expected strict|lenient)"
            )),
        }
    }
}

/// A single agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Defaults to the map key.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    /// Key into `openai_models`; the selection policy applies when unset.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_settings: Option<ModelSettings>,
    /// Names of tool servers this agent may call.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_json_schema: Option<ResponseSchema>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_tokens: None,
            response_json_schema: None,
        }
    }
}

fn default_temperature() -> f32 {
    1.0
}

/// Named JSON schema constraining an agent's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseSchema {
    pub name: String,
    pub json_schema_definition: JsonValue,
}

impl ResponseSchema {
    /// Chat-completions `response_format` payload for this schema.
    pub fn to_response_format(&self) -> JsonValue {
        json!({
            "type": "json_schema",
            "json_schema": {
                "schema": self.json_schema_definition,
                "name": self.name,
                "strict": true,
            }
        })
    }
}

/// One model deployment. Credentials are already resolved against the
/// environment when this value exists.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Model or deployment identifier; defaults to the map key.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Relative cost rank, lower is cheaper.
    #[serde(default)]
    pub cost: Option<u32>,
    /// Relative latency rank, lower is faster.
    #[serde(default)]
    pub latency: Option<u32>,
    /// Relative quality rank, higher is better.
    #[serde(default)]
    pub quality: Option<u32>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("cost", &self.cost)
            .field("latency", &self.latency)
            .field("quality", &self.quality)
            .finish()
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpConfig {
    pub failure_strategy: McpFailureStrategy,
    pub health_check_timeout: Duration,
    pub servers: IndexMap<String, McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            failure_strategy: McpFailureStrategy::default(),
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
            servers: IndexMap::new(),
        }
    }
}

/// Tool server definition, discriminated by transport kind.
#[derive(Debug, Clone, PartialEq)]
pub enum McpServerConfig {
    Stdio(StdioServerConfig),
    StreamableHttp(HttpServerConfig),
}

impl McpServerConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            McpServerConfig::Stdio(s) => s.timeout,
            McpServerConfig::StreamableHttp(h) => h.timeout,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            McpServerConfig::Stdio(_) => "stdio",
            McpServerConfig::StreamableHttp(_) => "streamable_http",
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            McpServerConfig::Stdio(s) => s.description.as_deref(),
            McpServerConfig::StreamableHttp(h) => h.description.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StdioServerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides merged on top of the parent process environment.
    pub env: IndexMap<String, String>,
    pub encoding: String,
    pub timeout: Duration,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpServerConfig {
    pub url: String,
    pub encoding: String,
    pub timeout: Duration,
    pub headers: IndexMap<String, String>,
    pub auth: Option<McpAuthConfig>,
    pub description: Option<String>,
}

/// Where a remote server's bearer token comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSourceKind {
    /// The caller's own token, forwarded from the inbound request.
    Forwarded,
    /// Read from an environment variable on every request.
    Env,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpAuthConfig {
    pub token_source: TokenSourceKind,
    #[serde(default)]
    pub env_var: Option<String>,
    /// With a forwarded token, the variable whose value authenticates the
    /// session requests (`initialize`, health checks, session close) that
    /// run without a caller. Unset means those requests carry no token.
    #[serde(default)]
    pub startup_env_var: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFactoryConfig {
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
}

/// HTTP exposure of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub card: AgentCardConfig,
    /// Defaults to `/<agent name>`.
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub enable_token_streaming: bool,
    #[serde(default = "default_history_threshold")]
    pub chat_history_threshold: usize,
    #[serde(default = "default_history_target")]
    pub chat_history_target: usize,
}

impl ServiceConfig {
    pub fn prefix_for(&self, agent: &str) -> String {
        self.path_prefix
            .clone()
            .unwrap_or_else(|| format!("/{agent}"))
    }
}

fn default_history_threshold() -> usize {
    DEFAULT_HISTORY_THRESHOLD
}

fn default_history_target() -> usize {
    DEFAULT_HISTORY_TARGET
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCardConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_card_version")]
    pub version: String,
    /// Public base URL advertised in the card; derived from the request when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub skills: Vec<SkillConfig>,
    #[serde(default = "default_modes")]
    pub default_input_modes: Vec<String>,
    #[serde(default = "default_modes")]
    pub default_output_modes: Vec<String>,
}

fn default_card_version() -> String {
    "1.0.0".to_string()
}

fn default_modes() -> Vec<String> {
    vec!["text".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Unit in which chat history size is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryUnit {
    #[default]
    Messages,
    Tokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryLimits {
    pub threshold_count: usize,
    pub target_count: usize,
    #[serde(default)]
    pub unit: HistoryUnit,
}

/// Console-side history trimming, per agent with an optional default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatHistorySettings {
    #[serde(default)]
    pub default: Option<HistoryLimits>,
    #[serde(default)]
    pub agents: IndexMap<String, HistoryLimits>,
}

impl ChatHistorySettings {
    pub fn limits_for(&self, agent: &str) -> Option<HistoryLimits> {
        self.agents.get(agent).copied().or(self.default)
    }
}
