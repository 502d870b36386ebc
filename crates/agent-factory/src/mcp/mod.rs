//! Tool servers over the Model Context Protocol: transports, request
//! interceptors, token sources and the provider that owns the connections.

pub mod connection;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;
pub mod interceptor;
pub mod provider;
pub mod stdio;
pub mod token;
pub mod types;

pub use connection::{DefaultConnector, McpConnection, McpConnector};
pub use interceptor::{BearerTokenInterceptor, OutboundRequest, RequestInterceptor};
pub use provider::McpProvider;
pub use token::{CachedTokenSource, EnvTokenSource, ForwardedTokenSource, TokenSource};
pub use types::*;
