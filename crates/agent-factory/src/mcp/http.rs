//! Streamable HTTP tool servers: JSON-RPC over POST, replies as plain JSON or
//! as an SSE body, session id echoed on every request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::connection::McpConnection;
use super::interceptor::{OutboundRequest, RequestInterceptor, apply_chain};
use super::types::{CallContext, JsonRpcRequest, JsonRpcResponse, RemoteTool, ToolCallOutcome};
use crate::config::HttpServerConfig;
use crate::error::ConnectionError;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct StreamableHttpConnection {
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    session_id: RwLock<Option<String>>,
    /// Used for requests no caller makes: handshake, tool listing, close.
    session_ctx: CallContext,
    next_id: AtomicU64,
}

impl StreamableHttpConnection {
    /// Open a session: `initialize` followed by `notifications/initialized`,
    /// both sent with `session_ctx`.
    pub async fn connect(
        name: &str,
        cfg: &HttpServerConfig,
        client: reqwest::Client,
        interceptors: Vec<Arc<dyn RequestInterceptor>>,
        session_ctx: CallContext,
    ) -> Result<Self, ConnectionError> {
        let conn = Self {
            name: name.to_string(),
            url: cfg.url.clone(),
            timeout: cfg.timeout,
            client,
            interceptors,
            session_id: RwLock::new(None),
            session_ctx,
            next_id: AtomicU64::new(1),
        };
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "agent-factory", "version": env!("CARGO_PKG_VERSION")},
        });
        conn.request("initialize", Some(params), &conn.session_ctx)
            .await
            .map_err(|e| match e {
                ConnectionError::Timeout { .. } => e,
                other => ConnectionError::Startup {
                    server: name.to_string(),
                    message: other.to_string(),
                },
            })?;
        conn.notify("notifications/initialized", &conn.session_ctx)
            .await?;
        info!(server = %name, url = %cfg.url, "streamable http server connected");
        Ok(conn)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<Value, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.err(e))?;
        let resp = self.send("POST", Some(body), ctx).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp.text().await.map_err(|e| self.map_reqwest(e, "response"))?;

        let reply = if content_type.starts_with("text/event-stream") {
            sse_data_payloads(&text)
                .into_iter()
                .filter_map(|d| serde_json::from_str::<JsonRpcResponse>(&d).ok())
                .find(|r| r.id.as_ref().and_then(Value::as_u64) == Some(id))
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).ok()
        };
        let Some(reply) = reply else {
            return Err(self.err(format!("no JSON-RPC response to '{method}'")));
        };
        if let Some(err) = reply.error {
            return Err(ConnectionError::Rpc {
                server: self.name.clone(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, ctx: &CallContext) -> Result<(), ConnectionError> {
        let body = serde_json::to_value(JsonRpcRequest::notification(method))
            .map_err(|e| self.err(e))?;
        self.send("POST", Some(body), ctx).await.map(|_| ())
    }

    async fn send(
        &self,
        method: &str,
        body: Option<Value>,
        ctx: &CallContext,
    ) -> Result<reqwest::Response, ConnectionError> {
        let mut headers = IndexMap::new();
        headers.insert(
            "Accept".to_string(),
            "application/json, text/event-stream".to_string(),
        );
        if let Some(sid) = self.session_id.read().await.clone() {
            headers.insert(SESSION_HEADER.to_string(), sid);
        }
        let outbound = OutboundRequest {
            server: self.name.clone(),
            method: method.to_string(),
            url: self.url.clone(),
            headers,
            body,
        };
        let outbound = apply_chain(&self.interceptors, outbound, ctx).await?;

        let http_method =
            reqwest::Method::from_bytes(outbound.method.as_bytes()).map_err(|e| self.err(e))?;
        let mut builder = self
            .client
            .request(http_method, &outbound.url)
            .headers(to_header_map(&outbound.headers).map_err(|e| self.err(e))?)
            .timeout(self.timeout);
        if let Some(body) = &outbound.body {
            builder = builder.json(body);
        }
        debug!(server = %self.name, method = %outbound.method, "mcp http request");
        let resp = builder
            .send()
            .await
            .map_err(|e| self.map_reqwest(e, "request"))?;

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(sid.to_string());
        }
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.err(format!("HTTP {status}: {text}")));
        }
        Ok(resp)
    }

    fn err(&self, e: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::Request {
            server: self.name.clone(),
            message: e.to_string(),
        }
    }

    fn map_reqwest(&self, e: reqwest::Error, phase: &'static str) -> ConnectionError {
        if e.is_timeout() {
            ConnectionError::Timeout {
                server: self.name.clone(),
                phase,
                seconds: self.timeout.as_secs().max(1),
            }
        } else {
            self.err(e)
        }
    }
}

#[async_trait::async_trait]
impl McpConnection for StreamableHttpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ConnectionError> {
        let result = self
            .request("tools/list", Some(json!({})), &self.session_ctx)
            .await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| self.err(e))
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<ToolCallOutcome, ConnectionError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments})),
                ctx,
            )
            .await?;
        Ok(ToolCallOutcome::from_result(&result))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.session_id.read().await.is_none() {
            return Ok(());
        }
        let res = self.send("DELETE", None, &self.session_ctx).await;
        *self.session_id.write().await = None;
        match res {
            Ok(_) => Ok(()),
            // Servers may not support explicit session termination.
            Err(e) => {
                debug!(server = %self.name, error = %e, "session delete failed");
                Ok(())
            }
        }
    }
}

fn to_header_map(headers: &IndexMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| format!("header {k}: {e}"))?;
        let value = HeaderValue::from_str(v).map_err(|e| format!("header {k}: {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Concatenated `data:` payloads of each SSE event in `body`.
pub(crate) fn sse_data_payloads(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data = String::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }
    events
}
