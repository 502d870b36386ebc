//! Optional per-user settings file, `<AGENT_FACTORY_HOME>/config.toml`.
//!
//! Only the `[logging]` table is read today. Environment variables always win
//! over values from the file; CLI flags win over both.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::EnvSource;

pub const HOME_DIR_NAME: &str = ".agent-factory";
pub const LOG_FILE_NAME: &str = "agent-factory.log";

#[derive(Debug, Default, Deserialize)]
pub struct UserSettings {
    pub logging: Option<LoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSettings {
    pub to_file: Option<bool>,
    pub dir: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub pretty: Option<bool>,
    pub level: Option<String>,
}

pub fn load_user_settings(home: &Path) -> anyhow::Result<Option<UserSettings>> {
    let path = home.join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)?;
    let cfg: UserSettings = toml::from_str(&s)?;
    Ok(Some(cfg))
}

pub fn expand_home(path: &str, env: &dyn EnvSource) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = env.var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

/// `AGENT_FACTORY_HOME`, else `$HOME/.agent-factory`, else `./.agent-factory`.
pub fn resolve_home(explicit: &str, env: &dyn EnvSource) -> PathBuf {
    if !explicit.is_empty() {
        return expand_home(explicit, env);
    }
    match env.var("HOME") {
        Some(home) => PathBuf::from(home).join(HOME_DIR_NAME),
        None => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(HOME_DIR_NAME),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
    Pretty,
    Full,
}

/// Effective logging options after env, settings file and CLI are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub filter: String,
    pub format: LogFormat,
    /// `None` disables file output.
    pub file_dir: Option<PathBuf>,
}

/// Values read from the environment, plus which of them were explicitly set.
#[derive(Debug, Clone, Default)]
pub struct LogEnv {
    pub filter: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub pretty: Option<bool>,
    pub to_file: Option<bool>,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LogCli {
    pub verbose: bool,
    pub log_dir: Option<PathBuf>,
}

pub const DEFAULT_LOG_FILTER: &str = "warn";

pub fn resolve_log_options(
    home: &Path,
    env: &LogEnv,
    settings: Option<&LoggingSettings>,
    cli: &LogCli,
) -> LogOptions {
    let pick_bool = |env_v: Option<bool>, file_v: Option<bool>, default: bool| {
        env_v.or(file_v).unwrap_or(default)
    };
    let file = |f: fn(&LoggingSettings) -> Option<bool>| settings.and_then(f);

    let mut filter = env
        .filter
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| settings.and_then(|s| s.level.clone()))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    if cli.verbose {
        filter = "debug".to_string();
    }

    let format = if pick_bool(env.json, file(|s| s.json), false) {
        LogFormat::Json
    } else if pick_bool(env.compact, file(|s| s.compact), true) {
        LogFormat::Compact
    } else if pick_bool(env.pretty, file(|s| s.pretty), false) {
        LogFormat::Pretty
    } else {
        LogFormat::Full
    };

    let to_file = cli.log_dir.is_some() || pick_bool(env.to_file, file(|s| s.to_file), false);
    let file_dir = to_file.then(|| {
        cli.log_dir
            .clone()
            .or_else(|| env.dir.clone().filter(|d| !d.is_empty()).map(PathBuf::from))
            .or_else(|| settings.and_then(|s| s.dir.clone()).map(PathBuf::from))
            .unwrap_or_else(|| home.join("logs"))
    });

    LogOptions {
        filter,
        format,
        file_dir,
    }
}
