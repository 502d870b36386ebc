//! Configuration-driven factory for chat agents backed by MCP tool servers.
//!
//! [`context::AppContext`] takes a validated [`config::AppConfig`], connects
//! the configured tool servers and builds every agent. The [`service`] and
//! [`console`] layers drive agents through it.

pub mod agent;
pub mod config;
pub mod console;
pub mod context;
pub mod error;
pub mod mcp;
pub mod model;
pub mod service;
pub mod settings;

pub use context::AppContext;
pub use error::{ConfigError, ConnectionError, FactoryError, InvocationError};
