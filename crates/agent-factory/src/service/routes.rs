//! HTTP surface: one card + JSON-RPC endpoint per configured service, and a
//! root health report.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::card::AgentCard;
use super::executor::AgentExecutor;
use super::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, MessageSendParams, PARSE_ERROR, RpcError,
    TaskIdParams, rpc_error, rpc_result,
};
use crate::agent::HistoryReducer;
use crate::config::{AgentCardConfig, HistoryUnit};
use crate::context::AppContext;
use crate::error::FactoryError;
use crate::mcp::{CallContext, ServerHealth};

struct ServiceState {
    prefix: String,
    card: AgentCardConfig,
    executor: Arc<AgentExecutor>,
}

/// Build the router for every service in the context's configuration.
pub fn router(ctx: Arc<AppContext>) -> Result<Router, FactoryError> {
    let mut app = Router::new()
        .route("/health", get(health))
        .with_state(ctx.clone());

    let services = ctx
        .config()
        .service_factory
        .as_ref()
        .map(|s| s.services.clone())
        .unwrap_or_default();
    for (agent_name, svc) in services {
        let agent = ctx.factory().get_agent(&agent_name)?;
        let reducer = HistoryReducer {
            threshold: svc.chat_history_threshold,
            target: svc.chat_history_target,
            unit: HistoryUnit::Messages,
        };
        let prefix = svc.prefix_for(&agent_name);
        let state = Arc::new(ServiceState {
            prefix: prefix.clone(),
            card: svc.card.clone(),
            executor: Arc::new(AgentExecutor::new(
                agent,
                reducer,
                svc.enable_token_streaming,
            )),
        });
        let base = prefix.trim_end_matches('/');
        let mut service = Router::new()
            .route(&format!("{base}/.well-known/agent.json"), get(agent_card))
            .route(&format!("{base}/"), post(rpc));
        if !base.is_empty() {
            service = service.route(base, post(rpc));
        }
        let service = service.with_state(state);
        info!(agent = %agent_name, prefix = %prefix, "service mounted");
        app = app.merge(service);
    }
    Ok(app)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    ctx.provider().refresh_all().await;
    let report = ctx.provider().health_report();
    let all_healthy = report.values().all(ServerHealth::is_healthy);
    let servers: serde_json::Map<String, Value> = report
        .into_iter()
        .map(|(name, h)| {
            let entry = match &h {
                ServerHealth::Healthy => json!({"status": h.label()}),
                ServerHealth::Unhealthy { reason } | ServerHealth::Unavailable { reason } => {
                    json!({"status": h.label(), "reason": reason})
                }
            };
            (name, entry)
        })
        .collect();
    Json(json!({
        "status": if all_healthy { "ok" } else { "degraded" },
        "agents": ctx.factory().agent_names(),
        "servers": servers,
    }))
}

async fn agent_card(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Json<AgentCard> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let fallback = format!("http://{host}{}/", state.prefix.trim_end_matches('/'));
    Json(AgentCard::from_config(&state.card, fallback))
}

/// Bearer token from the `Authorization` header, if any.
fn call_context(headers: &HeaderMap) -> CallContext {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, rest) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim().to_string())
        })
        .filter(|t| !t.is_empty());
    CallContext {
        access_token: token,
    }
}

fn params<T: serde::de::DeserializeOwned>(req: &Value) -> Result<T, RpcError> {
    serde_json::from_value(req.get("params").cloned().unwrap_or(Value::Null))
        .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

fn error_response(id: &Value, err: RpcError) -> Response {
    Json(rpc_error(id, &err)).into_response()
}

async fn rpc(State(state): State<Arc<ServiceState>>, headers: HeaderMap, body: Bytes) -> Response {
    let req: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&Value::Null, RpcError::new(PARSE_ERROR, e.to_string())),
    };
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = req.get("method").and_then(Value::as_str) else {
        return error_response(&id, RpcError::new(INVALID_REQUEST, "missing method"));
    };
    debug!(prefix = %state.prefix, %method, "rpc request");
    let ctx = call_context(&headers);

    match method {
        "message/send" => {
            let p: MessageSendParams = match params(&req) {
                Ok(p) => p,
                Err(e) => return error_response(&id, e),
            };
            match state.executor.send(p, ctx).await {
                Ok(task) => Json(rpc_result(&id, task)).into_response(),
                Err(e) => error_response(&id, e),
            }
        }
        "message/stream" => {
            let p: MessageSendParams = match params(&req) {
                Ok(p) => p,
                Err(e) => return error_response(&id, e),
            };
            match state.executor.stream(p, ctx) {
                Ok(events) => {
                    let sse = events.map(move |ev| {
                        Ok::<_, Infallible>(Event::default().data(rpc_result(&id, ev).to_string()))
                    });
                    Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
                }
                Err(e) => error_response(&id, e),
            }
        }
        "tasks/cancel" => match params::<TaskIdParams>(&req).and_then(|p| state.executor.cancel(&p.id)) {
            Ok(task) => Json(rpc_result(&id, task)).into_response(),
            Err(e) => error_response(&id, e),
        },
        "tasks/get" => match params::<TaskIdParams>(&req).and_then(|p| state.executor.get_task(&p.id)) {
            Ok(task) => Json(rpc_result(&id, task)).into_response(),
            Err(e) => error_response(&id, e),
        },
        other => error_response(
            &id,
            RpcError::new(METHOD_NOT_FOUND, format!("method '{other}' not found")),
        ),
    }
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    ctx: Arc<AppContext>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(ctx)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "serving agents");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
