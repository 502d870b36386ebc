//! Raw (as-parsed) configuration and the validation pass that turns it into
//! the typed graph. Every finding is collected; nothing stops at the first.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use super::env::{
    ENV_AZURE_OPENAI_ENDPOINT, ENV_MCP_FAILURE_STRATEGY, ENV_MODEL_SELECTION, ENV_OPENAI_API_KEY,
    EnvSource,
};
use super::schema::validate_response_schema;
use super::types::*;
use crate::error::ConfigIssue;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawAppConfig {
    #[serde(default)]
    pub agent_factory: RawAgentFactory,
    #[serde(default)]
    pub service_factory: Option<ServiceFactoryConfig>,
    #[serde(default)]
    pub chat_history: Option<ChatHistorySettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawAgentFactory {
    #[serde(default)]
    pub agents: IndexMap<String, AgentConfig>,
    #[serde(default)]
    pub openai_models: IndexMap<String, ModelConfig>,
    #[serde(default)]
    pub mcp: RawMcpConfig,
    #[serde(default)]
    pub model_selection: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawMcpConfig {
    #[serde(default)]
    pub failure_strategy: Option<String>,
    #[serde(default)]
    pub health_check_timeout: Option<f64>,
    #[serde(default)]
    pub servers: IndexMap<String, RawMcpServer>,
}

/// Flat server entry; the transport kind decides which fields are legal.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawMcpServer {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub auth: Option<McpAuthConfig>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Apply environment overrides and validate. Returns `None` when any issue
/// was recorded.
pub(crate) fn validate(
    raw: RawAppConfig,
    env: &dyn EnvSource,
    issues: &mut Vec<ConfigIssue>,
) -> Option<AppConfig> {
    let before = issues.len();
    let RawAppConfig {
        agent_factory,
        service_factory,
        chat_history,
    } = raw;

    let model_selection = resolve_model_selection(&agent_factory, env, issues);
    let declared: HashSet<String> = agent_factory.mcp.servers.keys().cloned().collect();
    let mcp = validate_mcp(agent_factory.mcp, env, issues);
    let openai_models = resolve_models(agent_factory.openai_models, env, issues);
    let agents = validate_agents(agent_factory.agents, &openai_models, &declared, issues);

    if let Some(sf) = &service_factory {
        validate_services(sf, &agents, issues);
    }
    let chat_history = chat_history.unwrap_or_default();
    validate_chat_history(&chat_history, &agents, issues);

    if issues.len() > before {
        return None;
    }
    Some(AppConfig {
        agent_factory: AgentFactoryConfig {
            agents,
            openai_models,
            mcp,
            model_selection,
        },
        service_factory,
        chat_history,
    })
}

fn resolve_model_selection(
    raw: &RawAgentFactory,
    env: &dyn EnvSource,
    issues: &mut Vec<ConfigIssue>,
) -> ModelSelectStrategy {
    let (value, path) = match env.var(ENV_MODEL_SELECTION) {
        Some(v) => (Some(v), ENV_MODEL_SELECTION.to_string()),
        None => (
            raw.model_selection.clone(),
            "agent_factory.model_selection".to_string(),
        ),
    };
    match value {
        None => ModelSelectStrategy::default(),
        Some(v) => v.parse().unwrap_or_else(|msg: String| {
            issues.push(ConfigIssue::new(path, msg));
            ModelSelectStrategy::default()
        }),
    }
}

fn validate_mcp(raw: RawMcpConfig, env: &dyn EnvSource, issues: &mut Vec<ConfigIssue>) -> McpConfig {
    let (strategy_value, strategy_path) = match env.var(ENV_MCP_FAILURE_STRATEGY) {
        Some(v) => (Some(v), ENV_MCP_FAILURE_STRATEGY.to_string()),
        None => (
            raw.failure_strategy,
            "agent_factory.mcp.failure_strategy".to_string(),
        ),
    };
    let failure_strategy = match strategy_value {
        None => McpFailureStrategy::default(),
        Some(v) => v.parse().unwrap_or_else(|msg: String| {
            issues.push(ConfigIssue::new(strategy_path, msg));
            McpFailureStrategy::default()
        }),
    };
    let health_check_timeout = seconds(
        raw.health_check_timeout,
        DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        "agent_factory.mcp.health_check_timeout",
        issues,
    );

    let mut servers = IndexMap::new();
    for (name, server) in raw.servers {
        let path = format!("agent_factory.mcp.servers.{name}");
        if !is_valid_name(&name) {
            issues.push(ConfigIssue::new(
                path.clone(),
                format!("server names may only contain letters, digits, '_' and '-' (at most {MAX_NAME_LEN})"),
            ));
        }
        if let Some(cfg) = validate_server(&path, server, issues) {
            servers.insert(name, cfg);
        }
    }
    McpConfig {
        failure_strategy,
        health_check_timeout,
        servers,
    }
}

fn validate_server(
    path: &str,
    raw: RawMcpServer,
    issues: &mut Vec<ConfigIssue>,
) -> Option<McpServerConfig> {
    let kind = match raw.kind.as_deref() {
        Some(k) => k.to_string(),
        None if raw.url.is_some() && raw.command.is_none() => "streamable_http".to_string(),
        None => "stdio".to_string(),
    };
    let timeout = seconds(
        raw.timeout,
        DEFAULT_SERVER_TIMEOUT_SECS,
        &format!("{path}.timeout"),
        issues,
    );
    let encoding = raw.encoding.unwrap_or_else(|| "utf-8".to_string());
    let reject = |field: &str, present: bool, issues: &mut Vec<ConfigIssue>| {
        if present {
            issues.push(ConfigIssue::new(
                format!("{path}.{field}"),
                format!("not allowed for a {kind} server"),
            ));
        }
    };

    match kind.as_str() {
        "stdio" => {
            reject("url", raw.url.is_some(), issues);
            reject("headers", raw.headers.is_some(), issues);
            reject("auth", raw.auth.is_some(), issues);
            let command = match raw.command.filter(|c| !c.trim().is_empty()) {
                Some(c) => c,
                None => {
                    issues.push(ConfigIssue::new(format!("{path}.command"), "required"));
                    return None;
                }
            };
            Some(McpServerConfig::Stdio(StdioServerConfig {
                command,
                args: raw.args.unwrap_or_default(),
                env: raw.env.unwrap_or_default(),
                encoding,
                timeout,
                description: raw.description,
            }))
        }
        "streamable_http" => {
            reject("command", raw.command.is_some(), issues);
            reject("args", raw.args.is_some(), issues);
            reject("env", raw.env.is_some(), issues);
            let url = match raw.url {
                Some(u) if u.starts_with("http://") || u.starts_with("https://") => u,
                Some(u) => {
                    issues.push(ConfigIssue::new(
                        format!("{path}.url"),
                        format!("'{u}' is not an absolute http(s) url"),
                    ));
                    return None;
                }
                None => {
                    issues.push(ConfigIssue::new(format!("{path}.url"), "required"));
                    return None;
                }
            };
            if let Some(auth) = &raw.auth
                && auth.token_source == TokenSourceKind::Env
                && auth.env_var.as_deref().is_none_or(|v| v.is_empty())
            {
                issues.push(ConfigIssue::new(
                    format!("{path}.auth.env_var"),
                    "required when token_source is 'env'",
                ));
            }
            if let Some(auth) = &raw.auth
                && let Some(var) = &auth.startup_env_var
            {
                if auth.token_source != TokenSourceKind::Forwarded {
                    issues.push(ConfigIssue::new(
                        format!("{path}.auth.startup_env_var"),
                        "only allowed when token_source is 'forwarded'",
                    ));
                } else if var.is_empty() {
                    issues.push(ConfigIssue::new(
                        format!("{path}.auth.startup_env_var"),
                        "must name an environment variable",
                    ));
                }
            }
            Some(McpServerConfig::StreamableHttp(HttpServerConfig {
                url,
                encoding,
                timeout,
                headers: raw.headers.unwrap_or_default(),
                auth: raw.auth,
                description: raw.description,
            }))
        }
        other => {
            issues.push(ConfigIssue::new(
                format!("{path}.type"),
                format!("unknown server type '{other}' (expected stdio|streamable_http)"),
            ));
            None
        }
    }
}

fn seconds(
    value: Option<f64>,
    default: u64,
    path: &str,
    issues: &mut Vec<ConfigIssue>,
) -> Duration {
    match value {
        None => Duration::from_secs(default),
        Some(v) if v.is_finite() && v > 0.0 => Duration::from_secs_f64(v),
        Some(v) => {
            issues.push(ConfigIssue::new(path, format!("must be > 0, got {v}")));
            Duration::from_secs(default)
        }
    }
}

fn resolve_models(
    models: IndexMap<String, ModelConfig>,
    env: &dyn EnvSource,
    issues: &mut Vec<ConfigIssue>,
) -> IndexMap<String, ModelConfig> {
    models
        .into_iter()
        .map(|(key, mut m)| {
            let path = format!("agent_factory.openai_models.{key}");
            if m.model.as_deref().is_none_or(str::is_empty) {
                m.model = Some(key.clone());
            }
            if m.api_key.as_deref().is_none_or(str::is_empty) {
                m.api_key = env.var(ENV_OPENAI_API_KEY);
            }
            if m.endpoint.as_deref().is_none_or(str::is_empty) {
                m.endpoint = env.var(ENV_AZURE_OPENAI_ENDPOINT).filter(|e| !e.is_empty());
            }
            if let Some(ep) = &m.endpoint
                && !(ep.starts_with("http://") || ep.starts_with("https://"))
            {
                issues.push(ConfigIssue::new(
                    format!("{path}.endpoint"),
                    format!("'{ep}' is not an absolute http(s) url"),
                ));
            }
            (key, m)
        })
        .collect()
}

/// Names end up in tool names and URL paths.
const MAX_NAME_LEN: usize = 64;

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_agents(
    agents: IndexMap<String, AgentConfig>,
    models: &IndexMap<String, ModelConfig>,
    declared_servers: &HashSet<String>,
    issues: &mut Vec<ConfigIssue>,
) -> IndexMap<String, AgentConfig> {
    let mut out = IndexMap::new();
    for (key, mut agent) in agents {
        let path = format!("agent_factory.agents.{key}");
        if !is_valid_name(&key) {
            issues.push(ConfigIssue::new(
                path.clone(),
                format!("agent names may only contain letters, digits, '_' and '-' (at most {MAX_NAME_LEN})"),
            ));
        }
        if agent.name.is_empty() {
            agent.name = key.clone();
        } else if agent.name != key {
            issues.push(ConfigIssue::new(
                format!("{path}.name"),
                format!("'{}' does not match its key '{key}'", agent.name),
            ));
        }
        match &agent.model {
            Some(m) if !models.contains_key(m) => issues.push(ConfigIssue::new(
                format!("{path}.model"),
                format!("unknown model '{m}'"),
            )),
            None if models.is_empty() => issues.push(ConfigIssue::new(
                format!("{path}.model"),
                "no model set and no openai_models declared",
            )),
            _ => {}
        }
        let mut seen = HashSet::new();
        for (i, server) in agent.mcp_servers.iter().enumerate() {
            if !declared_servers.contains(server) {
                issues.push(ConfigIssue::new(
                    format!("{path}.mcp_servers[{i}]"),
                    format!("unknown mcp server '{server}'"),
                ));
            }
            if !seen.insert(server) {
                issues.push(ConfigIssue::new(
                    format!("{path}.mcp_servers[{i}]"),
                    format!("duplicate mcp server '{server}'"),
                ));
            }
        }
        if let Some(settings) = &agent.model_settings {
            validate_settings(&format!("{path}.model_settings"), settings, issues);
        }
        out.insert(key, agent);
    }
    out
}

fn validate_settings(path: &str, s: &ModelSettings, issues: &mut Vec<ConfigIssue>) {
    let mut range = |field: &str, v: Option<f32>, lo: f32, hi: f32| {
        if let Some(v) = v
            && !(lo..=hi).contains(&v)
        {
            issues.push(ConfigIssue::new(
                format!("{path}.{field}"),
                format!("{v} is outside [{lo}, {hi}]"),
            ));
        }
    };
    range("temperature", Some(s.temperature), 0.0, 2.0);
    range("top_p", s.top_p, 0.0, 1.0);
    range("frequency_penalty", s.frequency_penalty, -2.0, 2.0);
    range("presence_penalty", s.presence_penalty, -2.0, 2.0);
    if s.max_tokens == Some(0) {
        issues.push(ConfigIssue::new(format!("{path}.max_tokens"), "must be > 0"));
    }
    if let Some(schema) = &s.response_json_schema {
        let schema_path = format!("{path}.response_json_schema");
        if schema.name.trim().is_empty() {
            issues.push(ConfigIssue::new(format!("{schema_path}.name"), "required"));
        }
        if let Err(v) = validate_response_schema(&schema.json_schema_definition) {
            issues.push(ConfigIssue::new(
                format!("{schema_path}.json_schema_definition"),
                v.to_string(),
            ));
        }
    }
}

fn validate_services(
    sf: &ServiceFactoryConfig,
    agents: &IndexMap<String, AgentConfig>,
    issues: &mut Vec<ConfigIssue>,
) {
    let mut prefixes: HashSet<String> = HashSet::new();
    for (name, svc) in &sf.services {
        let path = format!("service_factory.services.{name}");
        if !agents.contains_key(name) {
            issues.push(ConfigIssue::new(
                path.clone(),
                format!("no agent named '{name}'"),
            ));
        }
        if svc.chat_history_target >= svc.chat_history_threshold {
            issues.push(ConfigIssue::new(
                format!("{path}.chat_history_target"),
                format!(
                    "{} must be below chat_history_threshold {}",
                    svc.chat_history_target, svc.chat_history_threshold
                ),
            ));
        }
        let prefix = svc.prefix_for(name);
        let normalized = prefix.trim_end_matches('/');
        if !prefix.starts_with('/') {
            issues.push(ConfigIssue::new(
                format!("{path}.path_prefix"),
                format!("'{prefix}' must start with '/'"),
            ));
        }
        if prefix.contains([':', '*', '{', '}']) {
            issues.push(ConfigIssue::new(
                format!("{path}.path_prefix"),
                format!("'{prefix}' may not contain route parameters or wildcards"),
            ));
        }
        if normalized == "/health" || normalized.starts_with("/health/") {
            issues.push(ConfigIssue::new(
                format!("{path}.path_prefix"),
                "'/health' is reserved",
            ));
        }
        if !prefixes.insert(normalized.to_string()) {
            issues.push(ConfigIssue::new(
                format!("{path}.path_prefix"),
                format!("'{prefix}' is used by another service"),
            ));
        }
    }
}

fn validate_chat_history(
    settings: &ChatHistorySettings,
    agents: &IndexMap<String, AgentConfig>,
    issues: &mut Vec<ConfigIssue>,
) {
    let check = |path: String, l: &HistoryLimits, issues: &mut Vec<ConfigIssue>| {
        if l.target_count >= l.threshold_count {
            issues.push(ConfigIssue::new(
                format!("{path}.target_count"),
                format!(
                    "{} must be below threshold_count {}",
                    l.target_count, l.threshold_count
                ),
            ));
        }
    };
    if let Some(d) = &settings.default {
        check("chat_history.default".to_string(), d, issues);
    }
    for (name, limits) in &settings.agents {
        let path = format!("chat_history.agents.{name}");
        if !agents.contains_key(name) {
            issues.push(ConfigIssue::new(path.clone(), format!("no agent named '{name}'")));
        }
        check(path, limits, issues);
    }
}
