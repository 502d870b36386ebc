//! Request interceptors applied to every outbound HTTP request of a remote
//! tool server, in registration order.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use super::token::{TokenError, TokenSource};
use super::types::CallContext;
use crate::error::ConnectionError;

/// Outbound request as seen by interceptors, before it hits the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub server: String,
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    /// Insert or replace a header, matching names case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn before_request(
        &self,
        request: OutboundRequest,
        ctx: &CallContext,
    ) -> Result<OutboundRequest, ConnectionError>;
}

/// Run `request` through `chain` in order.
pub async fn apply_chain(
    chain: &[Arc<dyn RequestInterceptor>],
    mut request: OutboundRequest,
    ctx: &CallContext,
) -> Result<OutboundRequest, ConnectionError> {
    for interceptor in chain {
        request = interceptor.before_request(request, ctx).await?;
    }
    Ok(request)
}

/// Sets `Authorization: Bearer <token>` from a token source.
///
/// A missing token leaves the request unauthenticated; the server decides.
pub struct BearerTokenInterceptor {
    source: Arc<dyn TokenSource>,
}

impl BearerTokenInterceptor {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

#[async_trait::async_trait]
impl RequestInterceptor for BearerTokenInterceptor {
    async fn before_request(
        &self,
        mut request: OutboundRequest,
        ctx: &CallContext,
    ) -> Result<OutboundRequest, ConnectionError> {
        match self.source.token(ctx).await {
            Ok(tok) => {
                request.set_header("Authorization", format!("Bearer {}", tok.token));
                Ok(request)
            }
            Err(TokenError::Missing(reason)) => {
                debug!(server = %request.server, %reason, "sending request without bearer token");
                Ok(request)
            }
            Err(e @ TokenError::Upstream(_)) => Err(ConnectionError::Request {
                server: request.server,
                message: e.to_string(),
            }),
        }
    }
}

/// Adds fixed headers that are not already present.
pub struct StaticHeadersInterceptor {
    headers: IndexMap<String, String>,
}

impl StaticHeadersInterceptor {
    pub fn new(headers: IndexMap<String, String>) -> Self {
        Self { headers }
    }
}

#[async_trait::async_trait]
impl RequestInterceptor for StaticHeadersInterceptor {
    async fn before_request(
        &self,
        mut request: OutboundRequest,
        _ctx: &CallContext,
    ) -> Result<OutboundRequest, ConnectionError> {
        for (k, v) in &self.headers {
            if request.header(k).is_none() {
                request.set_header(k, v.clone());
            }
        }
        Ok(request)
    }
}
