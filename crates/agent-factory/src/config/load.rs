use std::path::Path;

use serde_yaml::Value;
use tracing::debug;

use super::env::{EnvSource, interpolate_tree};
use super::types::AppConfig;
use super::validate::{RawAppConfig, validate};
use crate::error::{ConfigError, ConfigIssue};

/// Load and validate a configuration file. No network or process I/O.
pub fn load_from_path(path: &Path, env: &dyn EnvSource) -> Result<AppConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::single(
            path.display().to_string(),
            format!("failed to read config: {e}"),
        )
    })?;
    debug!(path = %path.display(), "loading configuration");
    load_from_str(&text, env)
}

pub fn load_from_str(text: &str, env: &dyn EnvSource) -> Result<AppConfig, ConfigError> {
    let mut tree: Value = serde_yaml::from_str(text)
        .map_err(|e| ConfigError::single(yaml_location(&e), format!("invalid YAML: {e}")))?;
    if tree.is_null() {
        tree = Value::Mapping(Default::default());
    }

    let mut issues: Vec<ConfigIssue> = Vec::new();
    interpolate_tree(&mut tree, env, &mut issues);

    let raw: RawAppConfig = match serde_yaml::from_value(tree) {
        Ok(raw) => raw,
        Err(e) => {
            issues.push(ConfigIssue::new(yaml_location(&e), e.to_string()));
            return Err(ConfigError { issues });
        }
    };

    match validate(raw, env, &mut issues) {
        Some(cfg) if issues.is_empty() => Ok(cfg),
        _ => Err(ConfigError { issues }),
    }
}

fn yaml_location(e: &serde_yaml::Error) -> String {
    match e.location() {
        Some(loc) => format!("line {} column {}", loc.line(), loc.column()),
        None => "<root>".to_string(),
    }
}
