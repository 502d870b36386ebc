//! YAML configuration: parsing, `${VAR}` interpolation, environment overrides
//! and the validation pass.

pub mod env;
mod load;
pub mod schema;
pub mod types;
mod validate;

pub use env::{EnvSource, ProcessEnv};
pub use load::{load_from_path, load_from_str};
pub use types::*;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const CLI_EXAMPLE: &str = r#"
agent_factory:
  agents:
    Assistant:
      name: Assistant
      instructions: You are a helpful assistant.
      model: gpt-4
      model_settings:
        temperature: 0.7
        max_tokens: 1000
      mcp_servers: [time]
  openai_models:
    gpt-4:
      model: gpt-4
  mcp:
    servers:
      time:
        type: stdio
        command: uvx
        args: [mcp-server-time, --local-timezone=UTC]
"#;

    #[test]
    fn loads_cli_example() {
        let e = env(&[("OPENAI_API_KEY", "sk-test")]);
        let cfg = load_from_str(CLI_EXAMPLE, &e).unwrap();
        let af = &cfg.agent_factory;
        assert_eq!(af.agents.len(), 1);
        let agent = &af.agents["Assistant"];
        assert_eq!(agent.name, "Assistant");
        assert_eq!(agent.mcp_servers, vec!["time".to_string()]);
        assert_eq!(agent.model_settings.as_ref().unwrap().temperature, 0.7);
        assert_eq!(af.openai_models["gpt-4"].api_key.as_deref(), Some("sk-test"));
        assert_eq!(af.openai_models["gpt-4"].api_version, "2024-06-01");
        assert_eq!(af.mcp.failure_strategy, McpFailureStrategy::Lenient);
        assert_eq!(af.model_selection, ModelSelectStrategy::First);
        match &af.mcp.servers["time"] {
            McpServerConfig::Stdio(s) => {
                assert_eq!(s.command, "uvx");
                assert_eq!(s.args.len(), 2);
                assert_eq!(s.timeout, Duration::from_secs(5));
                assert_eq!(s.encoding, "utf-8");
            }
            other => panic!("unexpected server {other:?}"),
        }
    }

    #[test]
    fn name_defaults_to_key() {
        let yaml = "agent_factory:\n  openai_models: {m: {}}\n  agents:\n    helper:\n      instructions: hi\n";
        let cfg = load_from_str(yaml, &env(&[])).unwrap();
        assert_eq!(cfg.agent_factory.agents["helper"].name, "helper");
        assert_eq!(
            cfg.agent_factory.openai_models["m"].model.as_deref(),
            Some("m")
        );
    }

    #[test]
    fn dangling_references_are_collected() {
        let yaml = r#"
agent_factory:
  openai_models: {gpt: {}}
  agents:
    a:
      model: missing-model
      mcp_servers: [nope, also-nope]
  mcp:
    servers: {}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert_eq!(err.issues.len(), 3, "{err}");
        assert!(err.has_issue_at("agent_factory.agents.a.model"));
        assert!(err.has_issue_at("agent_factory.agents.a.mcp_servers[0]"));
        assert!(err.has_issue_at("agent_factory.agents.a.mcp_servers[1]"));
    }

    #[test]
    fn transport_fields_are_checked_per_kind() {
        let yaml = r#"
agent_factory:
  mcp:
    servers:
      local:
        type: stdio
        command: run
        url: http://localhost/mcp
      remote:
        type: streamable_http
        command: nope
      remote2:
        type: streamable_http
        url: ftp://host
      weird:
        type: websocket
        url: ws://x
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.mcp.servers.local.url"));
        assert!(err.has_issue_at("agent_factory.mcp.servers.remote.command"));
        assert!(err.has_issue_at("agent_factory.mcp.servers.remote.url"));
        assert!(err.has_issue_at("agent_factory.mcp.servers.remote2.url"));
        assert!(err.has_issue_at("agent_factory.mcp.servers.weird.type"));
    }

    #[test]
    fn url_without_type_is_streamable_http() {
        let yaml = r#"
agent_factory:
  mcp:
    servers:
      docs:
        url: https://docs.example.com/mcp
        timeout: 2.5
        auth: {token_source: forwarded}
"#;
        let cfg = load_from_str(yaml, &env(&[])).unwrap();
        match &cfg.agent_factory.mcp.servers["docs"] {
            McpServerConfig::StreamableHttp(h) => {
                assert_eq!(h.timeout, Duration::from_millis(2500));
                assert_eq!(h.auth.as_ref().unwrap().token_source, TokenSourceKind::Forwarded);
            }
            other => panic!("unexpected server {other:?}"),
        }
    }

    #[test]
    fn env_token_source_requires_var() {
        let yaml = r#"
agent_factory:
  mcp:
    servers:
      docs:
        type: streamable_http
        url: https://docs.example.com/mcp
        auth: {token_source: env}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.mcp.servers.docs.auth.env_var"));
    }

    #[test]
    fn startup_token_only_pairs_with_forwarded_tokens() {
        let yaml = r#"
agent_factory:
  mcp:
    servers:
      docs:
        type: streamable_http
        url: https://docs.example.com/mcp
        auth: {token_source: env, env_var: DOCS_TOKEN, startup_env_var: DOCS_STARTUP}
      wiki:
        type: streamable_http
        url: https://wiki.example.com/mcp
        auth: {token_source: forwarded, startup_env_var: WIKI_STARTUP}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.mcp.servers.docs.auth.startup_env_var"));
        assert!(!err.has_issue_at("agent_factory.mcp.servers.wiki.auth.startup_env_var"));
    }

    #[test]
    fn env_overrides_apply_and_are_validated() {
        let e = env(&[
            ("AGENT_FACTORY__MODEL_SELECTION", "quality"),
            ("AGENT_FACTORY__MCP_FAILURE_STRATEGY", "strict"),
        ]);
        let cfg = load_from_str("agent_factory:\n  model_selection: cost\n", &e).unwrap();
        assert_eq!(cfg.agent_factory.model_selection, ModelSelectStrategy::Quality);
        assert_eq!(cfg.agent_factory.mcp.failure_strategy, McpFailureStrategy::Strict);

        let bad = env(&[("AGENT_FACTORY__MODEL_SELECTION", "cheapest")]);
        let err = load_from_str("", &bad).unwrap_err();
        assert!(err.has_issue_at("AGENT_FACTORY__MODEL_SELECTION"));
    }

    #[test]
    fn unset_interpolation_is_an_issue() {
        let yaml = "agent_factory:\n  openai_models:\n    m:\n      api_key: ${NOT_SET}\n";
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.openai_models.m.api_key"));
    }

    #[test]
    fn endpoint_falls_back_to_azure_env() {
        let e = env(&[("AZURE_OPENAI_ENDPOINT", "https://my.openai.azure.com")]);
        let cfg = load_from_str("agent_factory:\n  openai_models: {gpt: {}}\n", &e).unwrap();
        assert_eq!(
            cfg.agent_factory.openai_models["gpt"].endpoint.as_deref(),
            Some("https://my.openai.azure.com")
        );
    }

    #[test]
    fn invalid_settings_and_schema_are_reported() {
        let yaml = r#"
agent_factory:
  openai_models: {gpt: {}}
  agents:
    bad name:
      model_settings:
        temperature: 3.5
        max_tokens: 0
        response_json_schema:
          name: Out
          json_schema_definition:
            type: object
            properties:
              s: {type: string, minLength: 2}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.agents.bad name"));
        assert!(err.has_issue_at("agent_factory.agents.bad name.model_settings.temperature"));
        assert!(err.has_issue_at("agent_factory.agents.bad name.model_settings.max_tokens"));
        assert!(err.has_issue_at(
            "agent_factory.agents.bad name.model_settings.response_json_schema.json_schema_definition"
        ));
    }

    #[test]
    fn unknown_agent_fields_are_rejected() {
        let yaml = "agent_factory:\n  agents:\n    a:\n      instructionz: typo\n";
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.to_string().contains("instructionz"));
    }

    #[test]
    fn services_and_history_are_checked() {
        let yaml = r#"
agent_factory:
  openai_models: {gpt: {}}
  agents:
    a: {instructions: x}
service_factory:
  services:
    a:
      card: {name: A}
      chat_history_threshold: 5
      chat_history_target: 10
    ghost:
      card: {name: G}
      path_prefix: /a
chat_history:
  agents:
    a: {threshold_count: 10, target_count: 10}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("service_factory.services.a.chat_history_target"));
        assert!(err.has_issue_at("service_factory.services.ghost"));
        assert!(err.has_issue_at("service_factory.services.ghost.path_prefix"));
        assert!(err.has_issue_at("chat_history.agents.a.target_count"));
    }

    #[test]
    fn service_prefixes_are_compared_normalized() {
        let yaml = r#"
agent_factory:
  openai_models: {gpt: {}}
  agents:
    a: {instructions: x}
    b: {instructions: x}
    c: {instructions: x}
    d: {instructions: x}
service_factory:
  services:
    a: {card: {name: A}, path_prefix: /health/}
    b: {card: {name: B}, path_prefix: "/agents/:id"}
    c: {card: {name: C}, path_prefix: /shared/}
    d: {card: {name: D}, path_prefix: /shared}
"#;
        let err = load_from_str(yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("service_factory.services.a.path_prefix"));
        assert!(err.has_issue_at("service_factory.services.b.path_prefix"));
        assert!(!err.has_issue_at("service_factory.services.c.path_prefix"));
        assert!(err.has_issue_at("service_factory.services.d.path_prefix"));
    }

    #[test]
    fn server_names_follow_agent_name_rules() {
        let long = "s".repeat(65);
        let yaml = format!(
            r#"
agent_factory:
  openai_models: {{gpt: {{}}}}
  mcp:
    servers:
      "bad name": {{type: stdio, command: x}}
      {long}: {{type: stdio, command: x}}
      good-name_2: {{type: stdio, command: x}}
"#
        );
        let err = load_from_str(&yaml, &env(&[])).unwrap_err();
        assert!(err.has_issue_at("agent_factory.mcp.servers.bad name"));
        assert!(err.has_issue_at(&format!("agent_factory.mcp.servers.{long}")));
        assert!(!err.has_issue_at("agent_factory.mcp.servers.good-name_2"));
    }

    #[test]
    fn service_defaults() {
        let yaml = r#"
agent_factory:
  openai_models: {gpt: {}}
  agents:
    a: {instructions: x}
service_factory:
  services:
    a:
      card: {name: A, description: Agent A}
"#;
        let cfg = load_from_str(yaml, &env(&[])).unwrap();
        let svc = &cfg.service_factory.unwrap().services["a"];
        assert_eq!(svc.chat_history_threshold, 1000);
        assert_eq!(svc.chat_history_target, 10);
        assert!(!svc.enable_token_streaming);
        assert_eq!(svc.prefix_for("a"), "/a");
        assert_eq!(svc.card.default_input_modes, vec!["text".to_string()]);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLI_EXAMPLE.as_bytes()).unwrap();
        let cfg = load_from_path(file.path(), &env(&[])).unwrap();
        assert!(cfg.agent_factory.agents.contains_key("Assistant"));

        let err = load_from_path(std::path::Path::new("/definitely/not/here.yaml"), &env(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
