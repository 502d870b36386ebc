//! Lifecycle and health of every configured tool server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::connection::{McpConnection, McpConnector};
use super::types::{ServerHealth, ToolDescriptor};
use crate::config::{McpConfig, McpFailureStrategy};
use crate::error::ConnectionError;

#[derive(Debug, Clone)]
struct ServerStatus {
    health: ServerHealth,
    tools: Vec<ToolDescriptor>,
}

/// Owns one connection per reachable server.
///
/// Connections are shared read-only by agents; only the provider closes them.
pub struct McpProvider {
    policy: McpFailureStrategy,
    health_check_timeout: Duration,
    order: Vec<String>,
    connections: Mutex<IndexMap<String, Arc<dyn McpConnection>>>,
    status: RwLock<HashMap<String, ServerStatus>>,
}

impl McpProvider {
    /// Connect to every server in `config` concurrently.
    ///
    /// Under [`McpFailureStrategy::Strict`] any failure closes the connections
    /// that did open and returns an error. Under `Lenient` failed servers are
    /// recorded as unavailable.
    pub async fn start(
        config: &McpConfig,
        connector: Arc<dyn McpConnector>,
    ) -> Result<Self, ConnectionError> {
        let mut set = tokio::task::JoinSet::new();
        let mut task_names = HashMap::new();
        for (name, server) in &config.servers {
            let task_name = name.clone();
            let name = name.clone();
            let server = server.clone();
            let connector = connector.clone();
            let handle = set.spawn(async move {
                let bound = connect_bound(server.timeout());
                let mut attempt = tokio::spawn({
                    let name = name.clone();
                    async move { connector.connect(&name, &server).await }
                });
                let res = match tokio::time::timeout(bound, &mut attempt).await {
                    Ok(Ok(res)) => res,
                    Ok(Err(e)) => Err(ConnectionError::Startup {
                        server: name.clone(),
                        message: format!("connect task failed: {e}"),
                    }),
                    Err(_) => {
                        tokio::spawn(close_late(name.clone(), attempt));
                        Err(ConnectionError::Timeout {
                            server: name.clone(),
                            phase: "connect",
                            seconds: bound.as_secs().max(1),
                        })
                    }
                };
                (name, res)
            });
            task_names.insert(handle.id(), task_name);
        }

        let mut opened: IndexMap<String, Arc<dyn McpConnection>> = IndexMap::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok((name, Ok(conn))) => {
                    debug!(server = %name, "connected");
                    opened.insert(name, conn);
                }
                Ok((name, Err(e))) => failures.push((name, e.to_string())),
                Err(e) => {
                    let name = task_names
                        .get(&e.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    failures.push((name, format!("connect task failed: {e}")));
                }
            }
        }

        if !failures.is_empty() && config.failure_strategy == McpFailureStrategy::Strict {
            close_all(opened.into_values().collect()).await;
            let failures: Vec<String> = failures.into_iter().map(|(_, msg)| msg).collect();
            return Err(ConnectionError::StrictStartup {
                count: failures.len(),
                failures,
            });
        }

        let mut status = HashMap::new();
        for (name, reason) in failures {
            warn!(server = %name, %reason, "mcp server unavailable");
            status.insert(
                name,
                ServerStatus {
                    health: ServerHealth::Unavailable { reason },
                    tools: Vec::new(),
                },
            );
        }
        for name in opened.keys() {
            status.insert(
                name.clone(),
                ServerStatus {
                    health: ServerHealth::Healthy,
                    tools: Vec::new(),
                },
            );
        }

        let order: Vec<String> = config.servers.keys().cloned().collect();
        // Keep declaration order regardless of completion order.
        let mut connections = IndexMap::new();
        for name in &order {
            if let Some(conn) = opened.shift_remove(name) {
                connections.insert(name.clone(), conn);
            }
        }
        info!(
            connected = connections.len(),
            configured = order.len(),
            "mcp provider started"
        );
        Ok(Self {
            policy: config.failure_strategy,
            health_check_timeout: config.health_check_timeout,
            order,
            connections: Mutex::new(connections),
            status: RwLock::new(status),
        })
    }

    pub fn policy(&self) -> McpFailureStrategy {
        self.policy
    }

    /// Run `tools/list` on each named, connected server under the health
    /// check timeout and record the outcome and the tool inventory.
    pub async fn refresh_health(&self, names: &[String]) {
        let targets: Vec<(String, Arc<dyn McpConnection>)> = {
            let conns = self.lock_connections();
            names
                .iter()
                .filter_map(|n| conns.get(n).map(|c| (n.clone(), c.clone())))
                .collect()
        };
        let timeout = self.health_check_timeout;
        let checks = targets.into_iter().map(|(name, conn)| async move {
            let res = tokio::time::timeout(timeout, conn.list_tools()).await;
            (name, res)
        });
        let results = futures::future::join_all(checks).await;

        let mut status = self.write_status();
        for (name, res) in results {
            let entry = match res {
                Ok(Ok(tools)) => {
                    let tools: Vec<ToolDescriptor> = tools
                        .into_iter()
                        .map(|t| ToolDescriptor::from_remote(&name, t))
                        .collect();
                    debug!(server = %name, tools = tools.len(), "health check ok");
                    ServerStatus {
                        health: ServerHealth::Healthy,
                        tools,
                    }
                }
                Ok(Err(e)) => {
                    warn!(server = %name, error = %e, "health check failed");
                    ServerStatus {
                        health: ServerHealth::Unhealthy {
                            reason: e.to_string(),
                        },
                        tools: Vec::new(),
                    }
                }
                Err(_) => {
                    warn!(server = %name, "health check timed out");
                    ServerStatus {
                        health: ServerHealth::Unhealthy {
                            reason: format!("no reply within {}s", timeout.as_secs_f64()),
                        },
                        tools: Vec::new(),
                    }
                }
            };
            status.insert(name, entry);
        }
    }

    /// Refresh every connected server.
    pub async fn refresh_all(&self) {
        let names = self.order.clone();
        self.refresh_health(&names).await;
    }

    /// Healthy servers in declaration order.
    pub fn available_servers(&self) -> Vec<String> {
        let status = self.read_status();
        self.order
            .iter()
            .filter(|n| status.get(*n).is_some_and(|s| s.health.is_healthy()))
            .cloned()
            .collect()
    }

    pub fn health(&self, name: &str) -> Option<ServerHealth> {
        self.read_status().get(name).map(|s| s.health.clone())
    }

    /// Health of every configured server in declaration order.
    pub fn health_report(&self) -> IndexMap<String, ServerHealth> {
        let status = self.read_status();
        self.order
            .iter()
            .filter_map(|n| status.get(n).map(|s| (n.clone(), s.health.clone())))
            .collect()
    }

    /// Tools from the last successful health check; empty when unhealthy.
    pub fn tools(&self, name: &str) -> Vec<ToolDescriptor> {
        self.read_status()
            .get(name)
            .filter(|s| s.health.is_healthy())
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    pub fn connection(&self, name: &str) -> Result<Arc<dyn McpConnection>, ConnectionError> {
        let healthy = self.health(name).is_some_and(|h| h.is_healthy());
        let conn = self.lock_connections().get(name).cloned();
        match conn {
            Some(c) if healthy => Ok(c),
            _ => Err(ConnectionError::Unavailable {
                server: name.to_string(),
            }),
        }
    }

    /// Close every open connection. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<dyn McpConnection>> = {
            let mut guard = self.lock_connections();
            guard.drain(..).map(|(_, c)| c).collect()
        };
        if conns.is_empty() {
            return;
        }
        {
            let mut status = self.write_status();
            for conn in &conns {
                status.insert(
                    conn.name().to_string(),
                    ServerStatus {
                        health: ServerHealth::Unavailable {
                            reason: "provider shut down".to_string(),
                        },
                        tools: Vec::new(),
                    },
                );
            }
        }
        let count = conns.len();
        close_all(conns).await;
        info!(closed = count, "mcp provider shut down");
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, IndexMap<String, Arc<dyn McpConnection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServerStatus>> {
        self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_status(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServerStatus>> {
        self.status.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for McpProvider {
    fn drop(&mut self) {
        let conns: Vec<Arc<dyn McpConnection>> = {
            let guard = self.connections.get_mut().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).map(|(_, c)| c).collect()
        };
        if conns.is_empty() {
            return;
        }
        warn!(
            open = conns.len(),
            "mcp provider dropped without shutdown; closing in background"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(close_all(conns));
        }
    }
}

/// Outer bound on one connect attempt. Connectors bound their own phases
/// (start, then cleanup on failure) by the server timeout, so this leaves room
/// for both before giving up on the attempt.
fn connect_bound(timeout: Duration) -> Duration {
    timeout * 2 + CONNECT_GRACE
}

const CONNECT_GRACE: Duration = Duration::from_secs(1);

/// Close whatever an abandoned connect attempt eventually opens.
async fn close_late(
    name: String,
    attempt: tokio::task::JoinHandle<Result<Arc<dyn McpConnection>, ConnectionError>>,
) {
    if let Ok(Ok(conn)) = attempt.await {
        debug!(server = %name, "closing connection that opened after its deadline");
        if let Err(e) = conn.close().await {
            warn!(server = %name, error = %e, "close failed");
        }
    }
}

async fn close_all(conns: Vec<Arc<dyn McpConnection>>) {
    let closes = conns.into_iter().map(|c| async move {
        if let Err(e) = c.close().await {
            warn!(server = %c.name(), error = %e, "close failed");
        }
    });
    futures::future::join_all(closes).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{McpServerConfig, StdioServerConfig};
    use crate::mcp::fake::{FakeConnector, fake_tool};

    fn stdio(name: &str) -> McpServerConfig {
        McpServerConfig::Stdio(StdioServerConfig {
            command: name.to_string(),
            args: vec![],
            env: IndexMap::new(),
            encoding: "utf-8".into(),
            timeout: Duration::from_millis(200),
            description: None,
        })
    }

    fn mcp_config(names: &[&str], policy: McpFailureStrategy) -> McpConfig {
        McpConfig {
            failure_strategy: policy,
            health_check_timeout: Duration::from_millis(200),
            servers: names.iter().map(|n| (n.to_string(), stdio(n))).collect(),
        }
    }

    #[tokio::test]
    async fn lenient_start_excludes_failed_servers() {
        let connector = Arc::new(FakeConnector::new().failing(&["b", "d"]));
        let cfg = mcp_config(&["a", "b", "c", "d"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector.clone()).await.unwrap();
        assert_eq!(provider.available_servers(), vec!["a", "c"]);
        assert!(matches!(
            provider.health("b"),
            Some(ServerHealth::Unavailable { .. })
        ));
        assert!(provider.connection("b").is_err());
        assert!(provider.connection("a").is_ok());
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn strict_start_fails_and_closes_opened() {
        let connector = Arc::new(FakeConnector::new().failing(&["bad"]));
        let cfg = mcp_config(&["one", "bad", "two"], McpFailureStrategy::Strict);
        let err = match McpProvider::start(&cfg, connector.clone()).await {
            Ok(_) => panic!("strict start should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ConnectionError::StrictStartup { count: 1, .. }));
        let opened = connector.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened.iter().all(|c| c.close_count() == 1));
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let connector =
            Arc::new(FakeConnector::new().slow(&["slow"], Duration::from_secs(5)));
        let cfg = mcp_config(&["slow", "fast"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector).await.unwrap();
        assert_eq!(provider.available_servers(), vec!["fast"]);
        match provider.health("slow") {
            Some(ServerHealth::Unavailable { reason }) => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        provider.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_connection_is_closed_after_timeout() {
        let connector =
            Arc::new(FakeConnector::new().slow(&["slow"], Duration::from_secs(5)));
        let cfg = mcp_config(&["slow"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector.clone()).await.unwrap();
        assert!(provider.available_servers().is_empty());
        assert!(connector.opened().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let late = connector.connection("slow").unwrap();
        assert_eq!(late.close_count(), 1);
        provider.shutdown().await;
        assert_eq!(late.close_count(), 1);
    }

    #[test]
    fn outer_connect_bound_exceeds_connector_phases() {
        let t = Duration::from_millis(200);
        assert!(connect_bound(t) > t * 2);
    }

    #[tokio::test]
    async fn health_refresh_tracks_reachability() {
        let connector = Arc::new(
            FakeConnector::new().with_tools("time", vec![fake_tool("get_current_time")]),
        );
        let cfg = mcp_config(&["time"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector.clone()).await.unwrap();
        provider.refresh_health(&["time".to_string()]).await;
        let tools = provider.tools("time");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].exposed_name, "time-get_current_time");

        connector.opened()[0].set_healthy(false);
        provider.refresh_all().await;
        assert!(matches!(
            provider.health("time"),
            Some(ServerHealth::Unhealthy { .. })
        ));
        assert!(provider.tools("time").is_empty());
        assert!(provider.available_servers().is_empty());

        connector.opened()[0].set_healthy(true);
        provider.refresh_all().await;
        assert_eq!(provider.available_servers(), vec!["time"]);
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_each_connection_once() {
        let connector = Arc::new(FakeConnector::new());
        let cfg = mcp_config(&["x", "y"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector.clone()).await.unwrap();
        provider.shutdown().await;
        provider.shutdown().await;
        assert!(connector.opened().iter().all(|c| c.close_count() == 1));
        assert!(provider.available_servers().is_empty());
        assert!(provider.connection("x").is_err());
    }

    #[tokio::test]
    async fn health_report_keeps_declaration_order() {
        let connector = Arc::new(FakeConnector::new().failing(&["m"]));
        let cfg = mcp_config(&["z", "m", "a"], McpFailureStrategy::Lenient);
        let provider = McpProvider::start(&cfg, connector).await.unwrap();
        let report = provider.health_report();
        let names: Vec<&String> = report.keys().collect();
        assert_eq!(names, vec!["z", "m", "a"]);
        assert_eq!(report["m"].label(), "unavailable");
        provider.shutdown().await;
    }
}
