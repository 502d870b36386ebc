//! A configured agent: instructions, one chat client and a tool table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{AgentEvent, FunctionCallEvent, FunctionResultEvent, TurnOutput};
use crate::config::ModelSettings;
use crate::error::InvocationError;
use crate::mcp::{CallContext, McpProvider, ToolDescriptor};
use crate::model::{ChatClient, ChatMessage, CompletionRequest, ResponseEvent, ToolCallRequest, ToolSpec};

/// Upper bound on model/tool round trips within one turn.
pub const MAX_TOOL_ROUNDS: usize = 16;

const EVENT_BUFFER: usize = 64;

pub type AgentEventStream = ReceiverStream<AgentEvent>;

pub struct Agent {
    name: String,
    instructions: String,
    model_key: String,
    settings: ModelSettings,
    client: Arc<dyn ChatClient>,
    tools: Vec<ToolDescriptor>,
    by_exposed_name: HashMap<String, usize>,
    provider: Arc<McpProvider>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model_key)
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl Agent {
    pub(crate) fn new(
        name: String,
        instructions: String,
        model_key: String,
        settings: ModelSettings,
        client: Arc<dyn ChatClient>,
        tools: Vec<ToolDescriptor>,
        provider: Arc<McpProvider>,
    ) -> Self {
        let by_exposed_name = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.exposed_name.clone(), i))
            .collect();
        Self {
            name,
            instructions,
            model_key,
            settings,
            client,
            tools,
            by_exposed_name,
            provider,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Key of the model entry this agent uses.
    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    /// Deployment or model id sent on the wire.
    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// `response_format` payload when a JSON schema is configured.
    pub fn response_format(&self) -> Option<Value> {
        self.settings
            .response_json_schema
            .as_ref()
            .map(|s| s.to_response_format())
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.exposed_name.as_str()).collect()
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.exposed_name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect()
    }

    /// Run one turn over `history` and stream its events. The stream always
    /// ends with [`AgentEvent::Completed`] or [`AgentEvent::Failed`].
    pub fn invoke_stream(
        self: &Arc<Self>,
        history: Vec<ChatMessage>,
        ctx: CallContext,
        cancel: CancellationToken,
    ) -> AgentEventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let last = match agent.run_turn(history, &ctx, &cancel, &tx).await {
                Ok(out) => AgentEvent::Completed(out),
                Err(e) => {
                    debug!(agent = %agent.name, error = %e, "turn ended with error");
                    AgentEvent::Failed(e)
                }
            };
            let _ = tx.send(last).await;
        });
        ReceiverStream::new(rx)
    }

    /// Run one turn to completion and return its output.
    pub async fn invoke(
        self: &Arc<Self>,
        history: Vec<ChatMessage>,
        ctx: CallContext,
        cancel: CancellationToken,
    ) -> Result<TurnOutput, InvocationError> {
        let mut events = self.invoke_stream(history, ctx, cancel);
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::Completed(out) => return Ok(out),
                AgentEvent::Failed(e) => return Err(e),
                _ => {}
            }
        }
        Err(InvocationError::Protocol("turn ended without a result".into()))
    }

    async fn run_turn(
        &self,
        history: Vec<ChatMessage>,
        ctx: &CallContext,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnOutput, InvocationError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.instructions.clone()));
        messages.extend(history);
        let mut produced: Vec<ChatMessage> = Vec::new();
        let specs = self.tool_specs();

        for round in 0..=MAX_TOOL_ROUNDS {
            if cancel.is_cancelled() {
                return Err(InvocationError::Cancelled);
            }
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: specs.clone(),
                settings: self.settings.clone(),
            };
            let (text, calls) = self.stream_completion(req, cancel, tx).await?;

            if calls.is_empty() {
                let reply = ChatMessage::assistant(text.clone());
                produced.push(reply);
                return Ok(TurnOutput {
                    text,
                    messages: produced,
                });
            }
            if round == MAX_TOOL_ROUNDS {
                break;
            }

            let assistant = ChatMessage::assistant_tool_calls(text, calls.clone());
            messages.push(assistant.clone());
            produced.push(assistant);

            for call in calls {
                let result = self.run_tool(&call, ctx, cancel, tx).await?;
                messages.push(result.clone());
                produced.push(result);
            }
        }
        warn!(agent = %self.name, rounds = MAX_TOOL_ROUNDS, "tool round limit reached");
        Err(InvocationError::Protocol(format!(
            "exceeded {MAX_TOOL_ROUNDS} tool rounds"
        )))
    }

    /// One model call: forwards text deltas and collects tool calls ordered
    /// by their stream index.
    async fn stream_completion(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<(String, Vec<ToolCallRequest>), InvocationError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
            res = self.client.complete(req) => res?,
        };

        let mut text = String::new();
        let mut pending: BTreeMap<u32, ToolCallRequest> = BTreeMap::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
                ev = stream.next() => ev,
            };
            match next {
                None | Some(Ok(ResponseEvent::Done)) => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(ResponseEvent::TextDelta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    if tx.send(AgentEvent::TextDelta(delta)).await.is_err() {
                        return Err(InvocationError::Cancelled);
                    }
                }
                Some(Ok(ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                })) => {
                    let slot = pending.entry(index).or_insert_with(|| ToolCallRequest {
                        id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments);
                }
                Some(Ok(ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                })) => {
                    debug!(agent = %self.name, input_tokens, output_tokens, "usage");
                }
            }
        }

        let calls = pending
            .into_values()
            .enumerate()
            .filter_map(|(i, mut call)| {
                if call.name.is_empty() {
                    warn!(agent = %self.name, "dropping tool call without a name");
                    return None;
                }
                if call.id.is_empty() {
                    call.id = format!("call_{i}");
                }
                Some(call)
            })
            .collect();
        Ok((text, calls))
    }

    /// Execute one tool call and return the tool-result message. Bad
    /// arguments, unknown tools and tool-reported errors go back to the
    /// model; transport failures end the turn.
    async fn run_tool(
        &self,
        call: &ToolCallRequest,
        ctx: &CallContext,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<ChatMessage, InvocationError> {
        let parsed: Result<Value, String> = if call.arguments.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| format!("invalid arguments: {e}"))
        };
        let shown_args = parsed
            .clone()
            .unwrap_or_else(|_| Value::String(call.arguments.clone()));
        let started = FunctionCallEvent::new(&call.id, &call.name, shown_args);
        if tx.send(AgentEvent::FunctionCall(started)).await.is_err() {
            return Err(InvocationError::Cancelled);
        }

        let (result, is_error) = match (parsed, self.by_exposed_name.get(&call.name)) {
            (Err(msg), _) => (msg, true),
            (Ok(_), None) => (format!("unknown function '{}'", call.name), true),
            (Ok(args), Some(&idx)) => {
                let tool = &self.tools[idx];
                let conn = self
                    .provider
                    .connection(&tool.server)
                    .map_err(|e| InvocationError::Tool {
                        tool: call.name.clone(),
                        message: e.to_string(),
                    })?;
                debug!(agent = %self.name, server = %tool.server, tool = %tool.name, "calling tool");
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
                    res = conn.call_tool(&tool.name, args, ctx) => res,
                }
                .map_err(|e| InvocationError::Tool {
                    tool: call.name.clone(),
                    message: e.to_string(),
                })?;
                (outcome.text, outcome.is_error)
            }
        };

        let finished = FunctionResultEvent::new(&call.id, &call.name, result.clone(), is_error);
        if tx.send(AgentEvent::FunctionResult(finished)).await.is_err() {
            return Err(InvocationError::Cancelled);
        }
        Ok(ChatMessage::tool_result(&call.id, result))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::*;
    use crate::config::{McpConfig, McpFailureStrategy, McpServerConfig, StdioServerConfig};
    use crate::mcp::fake::{FakeConnector, fake_tool};
    use crate::model::fake::{ScriptedClient, text_reply, tool_call_reply};
    use crate::model::Role;

    async fn provider_with_time(connector: Arc<FakeConnector>) -> Arc<McpProvider> {
        let server = McpServerConfig::Stdio(StdioServerConfig {
            command: "uvx".into(),
            args: vec!["mcp-server-time".into()],
            env: IndexMap::new(),
            encoding: "utf-8".into(),
            timeout: Duration::from_secs(5),
            description: None,
        });
        let cfg = McpConfig {
            failure_strategy: McpFailureStrategy::Lenient,
            health_check_timeout: Duration::from_secs(1),
            servers: [("time".to_string(), server)].into_iter().collect(),
        };
        let provider = Arc::new(McpProvider::start(&cfg, connector).await.unwrap());
        provider.refresh_all().await;
        provider
    }

    fn agent(client: Arc<ScriptedClient>, provider: Arc<McpProvider>) -> Arc<Agent> {
        Arc::new(Agent::new(
            "Assistant".into(),
            "Be brief.".into(),
            "gpt-4".into(),
            ModelSettings::default(),
            client,
            provider.tools("time"),
            provider,
        ))
    }

    fn time_connector() -> Arc<FakeConnector> {
        Arc::new(FakeConnector::new().with_tools("time", vec![fake_tool("get_current_time")]))
    }

    async fn collect(stream: AgentEventStream) -> Vec<AgentEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn plain_reply_streams_text_then_completes() {
        let provider = provider_with_time(time_connector()).await;
        let client = Arc::new(ScriptedClient::new("gpt-4", vec![text_reply("hello")]));
        let a = agent(client.clone(), provider.clone());

        let events = collect(a.invoke_stream(
            vec![ChatMessage::user("hi")],
            CallContext::default(),
            CancellationToken::new(),
        ))
        .await;
        assert!(matches!(&events[0], AgentEvent::TextDelta(t) if t == "hello"));
        match events.last().unwrap() {
            AgentEvent::Completed(out) => {
                assert_eq!(out.text, "hello");
                assert_eq!(out.messages.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let req = &client.requests()[0];
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].content, "Be brief.");
        assert_eq!(req.tools[0].name, "time-get_current_time");
        assert!(req.tools[0].parameters["properties"].get("access_token").is_none());
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn tool_calls_run_in_order_with_forwarded_context() {
        let connector = time_connector();
        let provider = provider_with_time(connector.clone()).await;
        let client = Arc::new(ScriptedClient::new(
            "gpt-4",
            vec![
                tool_call_reply(&[
                    ("c1", "time-get_current_time", r#"{"timezone":"UTC"}"#),
                    ("c2", "time-get_current_time", r#"{"timezone":"CET"}"#),
                ]),
                text_reply("It is noon."),
            ],
        ));
        let a = agent(client.clone(), provider.clone());

        let events = collect(a.invoke_stream(
            vec![ChatMessage::user("time?")],
            CallContext::with_token("tok"),
            CancellationToken::new(),
        ))
        .await;

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::FunctionCall(_) => "call",
                AgentEvent::FunctionResult(_) => "result",
                AgentEvent::TextDelta(_) => "text",
                AgentEvent::Completed(_) => "done",
                AgentEvent::Failed(_) => "failed",
            })
            .collect();
        assert_eq!(kinds, vec!["call", "result", "call", "result", "text", "done"]);

        let calls = connector.connection("time").unwrap().calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1["timezone"], "UTC");
        assert_eq!(calls[1].1["timezone"], "CET");
        assert_eq!(calls[0].2.access_token.as_deref(), Some("tok"));

        let second = &client.requests()[1];
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
        assert_eq!(second.messages[3].tool_call_id.as_deref(), Some("c1"));
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_function_is_reported_back_to_model() {
        let provider = provider_with_time(time_connector()).await;
        let client = Arc::new(ScriptedClient::new(
            "gpt-4",
            vec![tool_call_reply(&[("c1", "nope-tool", "{}")]), text_reply("sorry")],
        ));
        let a = agent(client.clone(), provider.clone());
        let out = a
            .invoke(vec![ChatMessage::user("x")], CallContext::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.text, "sorry");
        let tool_msg = &out.messages[1];
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.content.contains("unknown function"));
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_round_limit() {
        let provider = provider_with_time(time_connector()).await;
        let script = (0..=MAX_TOOL_ROUNDS)
            .map(|i| {
                let id = format!("c{i}");
                tool_call_reply(&[(id.as_str(), "time-get_current_time", "{}")])
            })
            .collect();
        let client = Arc::new(ScriptedClient::new("gpt-4", script));
        let a = agent(client.clone(), provider.clone());
        let err = a
            .invoke(vec![ChatMessage::user("x")], CallContext::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Protocol(m) if m.contains("tool rounds")));
        assert_eq!(client.requests().len(), MAX_TOOL_ROUNDS + 1);
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_ends_turn() {
        let provider = provider_with_time(time_connector()).await;
        let client = Arc::new(
            ScriptedClient::new("gpt-4", vec![text_reply("slow")])
                .with_event_delay(Duration::from_secs(30)),
        );
        let a = agent(client, provider.clone());
        let cancel = CancellationToken::new();
        let stream = a.invoke_stream(vec![ChatMessage::user("x")], CallContext::default(), cancel.clone());
        cancel.cancel();
        let events = tokio::time::timeout(Duration::from_secs(5), collect(stream))
            .await
            .unwrap();
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Failed(InvocationError::Cancelled))
        ));
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn unavailable_server_fails_the_turn() {
        let provider = provider_with_time(time_connector()).await;
        let client = Arc::new(ScriptedClient::new(
            "gpt-4",
            vec![tool_call_reply(&[("c1", "time-get_current_time", "{}")])],
        ));
        let a = agent(client, provider.clone());
        provider.shutdown().await;
        let err = a
            .invoke(vec![ChatMessage::user("x")], CallContext::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Tool { .. }));
    }
}
