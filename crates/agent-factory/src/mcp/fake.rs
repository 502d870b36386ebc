//! In-memory tool servers for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use super::connection::{McpConnection, McpConnector};
use super::types::{CallContext, RemoteTool, ToolCallOutcome};
use crate::config::McpServerConfig;
use crate::error::ConnectionError;

pub fn fake_tool(name: &str) -> RemoteTool {
    RemoteTool {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: json!({
            "type": "object",
            "properties": {"timezone": {"type": "string"}, "access_token": {"type": "string"}},
        }),
    }
}

pub struct FakeConnection {
    name: String,
    tools: Vec<RemoteTool>,
    healthy: AtomicBool,
    closes: AtomicUsize,
    calls: Mutex<Vec<(String, Value, CallContext)>>,
}

impl FakeConnection {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value, CallContext)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl McpConnection for FakeConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ConnectionError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ConnectionError::Request {
                server: self.name.clone(),
                message: "down".into(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<ToolCallOutcome, ConnectionError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments.clone(), ctx.clone()));
        Ok(ToolCallOutcome {
            text: format!("{}:{tool}({arguments})", self.name),
            is_error: false,
        })
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    failing: HashSet<String>,
    unhealthy: HashSet<String>,
    slow: HashMap<String, Duration>,
    tools: HashMap<String, Vec<RemoteTool>>,
    opened: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, names: &[&str]) -> Self {
        self.failing.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Connect fine, then fail every `tools/list`.
    pub fn unhealthy(mut self, names: &[&str]) -> Self {
        self.unhealthy.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn slow(mut self, names: &[&str], delay: Duration) -> Self {
        for n in names {
            self.slow.insert(n.to_string(), delay);
        }
        self
    }

    pub fn with_tools(mut self, server: &str, tools: Vec<RemoteTool>) -> Self {
        self.tools.insert(server.to_string(), tools);
        self
    }

    pub fn opened(&self) -> Vec<Arc<FakeConnection>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<FakeConnection>> {
        self.opened().into_iter().find(|c| c.name == name)
    }
}

#[async_trait::async_trait]
impl McpConnector for FakeConnector {
    async fn connect(
        &self,
        name: &str,
        _config: &McpServerConfig,
    ) -> Result<Arc<dyn McpConnection>, ConnectionError> {
        if let Some(d) = self.slow.get(name) {
            tokio::time::sleep(*d).await;
        }
        if self.failing.contains(name) {
            return Err(ConnectionError::Startup {
                server: name.to_string(),
                message: "spawn failed".into(),
            });
        }
        let conn = Arc::new(FakeConnection {
            name: name.to_string(),
            tools: self.tools.get(name).cloned().unwrap_or_default(),
            healthy: AtomicBool::new(!self.unhealthy.contains(name)),
            closes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        });
        self.opened.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
