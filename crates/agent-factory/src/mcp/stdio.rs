//! stdio tool servers, driven through the `rust-mcp-sdk` client runtime.
//!
//! The server process is launched with the parent environment plus the
//! configured overrides. Every phase is bounded by the server's timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_mcp_sdk::McpClient;
use rust_mcp_sdk::mcp_client::{ClientHandlerCore, ClientRuntime, client_runtime_core};
use rust_mcp_sdk::schema::schema_utils::{
    NotificationFromServer, RequestFromServer, ResultFromClient,
};
use rust_mcp_sdk::schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams,
    LATEST_PROTOCOL_VERSION, RpcError,
};
use rust_mcp_sdk::{StdioTransport, TransportOptions};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::connection::McpConnection;
use super::types::{CallContext, RemoteTool, ToolCallOutcome};
use crate::config::StdioServerConfig;
use crate::error::ConnectionError;

pub struct StdioConnection {
    name: String,
    client: Arc<ClientRuntime>,
    timeout: Duration,
}

impl StdioConnection {
    pub async fn connect(name: &str, cfg: &StdioServerConfig) -> Result<Self, ConnectionError> {
        let client_details = InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "agent-factory".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            protocol_version: LATEST_PROTOCOL_VERSION.into(),
        };

        let env: HashMap<String, String> = cfg
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        debug!(server = %name, command = %cfg.command, encoding = %cfg.encoding, "launching stdio server");
        let transport = StdioTransport::create_with_server_launch(
            &cfg.command,
            cfg.args.clone(),
            Some(env),
            TransportOptions::default(),
        )
        .map_err(|e| ConnectionError::Startup {
            server: name.to_string(),
            message: format!("transport error: {e}"),
        })?;

        let client = client_runtime_core::create_client(client_details, transport, NoopClientHandler);
        let conn = Self {
            name: name.to_string(),
            client,
            timeout: cfg.timeout,
        };

        let started = conn
            .bounded("start", conn.client.clone().start())
            .await
            .and_then(|r| {
                r.map_err(|e| ConnectionError::Startup {
                    server: conn.name.clone(),
                    message: format!("start error: {e}"),
                })
            });
        if let Err(e) = started {
            // The child may already be running.
            let _ = conn.bounded("shutdown", conn.client.shut_down()).await;
            return Err(e);
        }
        info!(server = %name, "stdio server connected");
        Ok(conn)
    }

    async fn bounded<T>(
        &self,
        phase: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, ConnectionError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ConnectionError::Timeout {
                server: self.name.clone(),
                phase,
                seconds: self.timeout.as_secs().max(1),
            })
    }

    fn request_error(&self, what: &str, e: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::Request {
            server: self.name.clone(),
            message: format!("{what} error: {e}"),
        }
    }
}

#[async_trait::async_trait]
impl McpConnection for StdioConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ConnectionError> {
        let resp = self
            .bounded("list_tools", self.client.list_tools(None))
            .await?
            .map_err(|e| self.request_error("list_tools", e))?;
        resp.tools
            .iter()
            .map(|t| {
                serde_json::to_value(t)
                    .and_then(serde_json::from_value::<RemoteTool>)
                    .map_err(|e| self.request_error("tool decode", e))
            })
            .collect()
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        _ctx: &CallContext,
    ) -> Result<ToolCallOutcome, ConnectionError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let params: CallToolRequestParams =
            serde_json::from_value(json!({ "name": tool, "arguments": arguments }))
                .map_err(|e| self.request_error("call_tool params", e))?;
        let result = self
            .bounded("call_tool", self.client.call_tool(params))
            .await?
            .map_err(|e| self.request_error("call_tool", e))?;
        let raw = serde_json::to_value(&result).map_err(|e| self.request_error("call_tool", e))?;
        Ok(ToolCallOutcome::from_result(&raw))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.bounded("shutdown", self.client.shut_down())
            .await?
            .map_err(|e| self.request_error("shutdown", e))?;
        debug!(server = %self.name, "stdio server closed");
        Ok(())
    }
}

#[derive(Clone)]
struct NoopClientHandler;

#[async_trait::async_trait]
impl ClientHandlerCore for NoopClientHandler {
    async fn handle_request(
        &self,
        _request: RequestFromServer,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<ResultFromClient, RpcError> {
        Err(RpcError::method_not_found())
    }

    async fn handle_notification(
        &self,
        _notification: NotificationFromServer,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<(), RpcError> {
        Ok(())
    }

    async fn handle_error(
        &self,
        _error: &RpcError,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<(), RpcError> {
        Ok(())
    }
}
