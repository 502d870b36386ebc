//! Environment access and `${VAR}` interpolation.

use std::collections::HashMap;

use serde_yaml::Value;

use crate::error::ConfigIssue;

pub const ENV_MODEL_SELECTION: &str = "AGENT_FACTORY__MODEL_SELECTION";
pub const ENV_MCP_FAILURE_STRATEGY: &str = "AGENT_FACTORY__MCP_FAILURE_STRATEGY";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_AZURE_OPENAI_ENDPOINT: &str = "AZURE_OPENAI_ENDPOINT";

/// Read-only view of environment variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<T: EnvSource + ?Sized> EnvSource for &T {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// Expand `${VAR}` in one string. `$${` yields a literal `${`.
/// Unset variables are returned as errors and left in place.
pub fn interpolate_str(input: &str, env: &dyn EnvSource) -> (String, Vec<String>) {
    let mut out = String::with_capacity(input.len());
    let mut missing = Vec::new();
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("$${") {
            out.push_str("${");
            rest = after;
            continue;
        }
        if let Some(after) = tail.strip_prefix("${")
            && let Some(end) = after.find('}')
            && is_var_name(&after[..end])
        {
            let name = &after[..end];
            match env.var(name) {
                Some(v) => out.push_str(&v),
                None => {
                    missing.push(name.to_string());
                    out.push_str(&tail[..end + 3]);
                }
            }
            rest = &after[end + 1..];
            continue;
        }
        out.push('$');
        rest = &tail[1..];
    }
    out.push_str(rest);
    (out, missing)
}

fn is_var_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Walk a YAML tree, expanding every string scalar in place.
pub fn interpolate_tree(value: &mut Value, env: &dyn EnvSource, issues: &mut Vec<ConfigIssue>) {
    walk(value, String::new(), env, issues);
}

fn walk(value: &mut Value, path: String, env: &dyn EnvSource, issues: &mut Vec<ConfigIssue>) {
    match value {
        Value::String(s) => {
            let (expanded, missing) = interpolate_str(s, env);
            for name in missing {
                issues.push(ConfigIssue::new(
                    display_path(&path),
                    format!("environment variable '{name}' is not set"),
                ));
            }
            *s = expanded;
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                walk(item, format!("{path}[{i}]"), env, issues);
            }
        }
        Value::Mapping(map) => {
            for (k, v) in map.iter_mut() {
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                let child = if path.is_empty() {
                    key
                } else {
                    format!("{path}.{key}")
                };
                walk(v, child, env, issues);
            }
        }
        Value::Tagged(tagged) => walk(&mut tagged.value, path, env, issues),
        _ => {}
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
