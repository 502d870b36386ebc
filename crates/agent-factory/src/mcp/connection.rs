//! Connection traits and the default transport dispatcher.

use std::sync::Arc;

use serde_json::Value;

use super::http::StreamableHttpConnection;
use super::interceptor::{BearerTokenInterceptor, RequestInterceptor, StaticHeadersInterceptor};
use super::stdio::StdioConnection;
use super::token::{CachedTokenSource, EnvTokenSource, ForwardedTokenSource, TokenSource};
use super::types::{CallContext, RemoteTool, ToolCallOutcome};
use crate::config::{EnvSource, McpAuthConfig, McpServerConfig, TokenSourceKind};
use crate::error::ConnectionError;

/// A live session with one tool server.
#[async_trait::async_trait]
pub trait McpConnection: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ConnectionError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<ToolCallOutcome, ConnectionError>;

    /// Release the process or session. Called at most once by the provider.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens connections from server definitions.
#[async_trait::async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpConnection>, ConnectionError>;
}

/// Dispatches on transport kind: stdio via the SDK client runtime, streamable
/// HTTP via the in-crate JSON-RPC client.
pub struct DefaultConnector {
    env: Arc<dyn EnvSource>,
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            http: reqwest::Client::new(),
        }
    }

    fn interceptors(
        &self,
        headers: &indexmap::IndexMap<String, String>,
        auth: Option<&McpAuthConfig>,
    ) -> Vec<Arc<dyn RequestInterceptor>> {
        let mut chain: Vec<Arc<dyn RequestInterceptor>> = Vec::new();
        if !headers.is_empty() {
            chain.push(Arc::new(StaticHeadersInterceptor::new(headers.clone())));
        }
        if let Some(auth) = auth {
            let source: Arc<dyn TokenSource> = match auth.token_source {
                TokenSourceKind::Forwarded => Arc::new(ForwardedTokenSource),
                TokenSourceKind::Env => Arc::new(CachedTokenSource::new(EnvTokenSource::new(
                    auth.env_var.clone().unwrap_or_default(),
                    self.env.clone(),
                ))),
            };
            chain.push(Arc::new(BearerTokenInterceptor::new(source)));
        }
        chain
    }

    /// Context for requests made on the server's behalf rather than a caller's.
    fn session_context(
        &self,
        server: &str,
        auth: Option<&McpAuthConfig>,
    ) -> Result<CallContext, ConnectionError> {
        let Some(var) = auth.and_then(|a| a.startup_env_var.as_deref()) else {
            return Ok(CallContext::default());
        };
        match self.env.var(var).filter(|v| !v.is_empty()) {
            Some(token) => Ok(CallContext::with_token(token)),
            None => Err(ConnectionError::Startup {
                server: server.to_string(),
                message: format!("startup token variable '{var}' is not set"),
            }),
        }
    }
}

#[async_trait::async_trait]
impl McpConnector for DefaultConnector {
    async fn connect(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpConnection>, ConnectionError> {
        match config {
            McpServerConfig::Stdio(cfg) => {
                let conn = StdioConnection::connect(name, cfg).await?;
                Ok(Arc::new(conn))
            }
            McpServerConfig::StreamableHttp(cfg) => {
                let chain = self.interceptors(&cfg.headers, cfg.auth.as_ref());
                let session_ctx = self.session_context(name, cfg.auth.as_ref())?;
                let conn = StreamableHttpConnection::connect(
                    name,
                    cfg,
                    self.http.clone(),
                    chain,
                    session_ctx,
                )
                .await?;
                Ok(Arc::new(conn))
            }
        }
    }
}
