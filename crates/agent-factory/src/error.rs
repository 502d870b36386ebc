//! Error taxonomy shared across the factory.
//!
//! Configuration errors abort startup, connection errors are governed by the
//! MCP failure strategy, invocation errors fail a single turn, and not-found
//! errors are returned straight to the caller.

use std::fmt;

/// A single validation finding, addressed by its YAML path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every issue found while loading a configuration, reported together.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid configuration ({} issue(s)):\n{}", .issues.len(), render_issues(.issues))]
pub struct ConfigError {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ConfigIssue::new(path, message)],
        }
    }

    /// True if any issue is reported at exactly `path`.
    pub fn has_issue_at(&self, path: &str) -> bool {
        self.issues.iter().any(|i| i.path == path)
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Kind of named entity a caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Agent,
    Model,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Agent => "agent",
            EntityKind::Model => "model",
        };
        f.write_str(s)
    }
}

/// Failure talking to a tool server.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to start mcp server '{server}': {message}")]
    Startup { server: String, message: String },
    #[error("mcp server '{server}' timed out after {seconds}s during {phase}")]
    Timeout {
        server: String,
        phase: &'static str,
        seconds: u64,
    },
    #[error("mcp server '{server}' request failed: {message}")]
    Request { server: String, message: String },
    #[error("mcp server '{server}' returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("mcp server '{server}' is not available")]
    Unavailable { server: String },
    #[error("{count} mcp server(s) failed to start under the strict policy: {}", .failures.join("; "))]
    StrictStartup { count: usize, failures: Vec<String> },
}

/// Failure during a single agent turn.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },
    #[error("invocation cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Top-level error returned by factory operations.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },
}

impl FactoryError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        FactoryError::NotFound {
            kind,
            name: name.into(),
        }
    }
}
