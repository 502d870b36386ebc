//! Streaming chat-completions client for OpenAI and Azure OpenAI.
//!
//! Auth styles:
//! - Azure (endpoint configured): deployment URL with `api-version`, `api-key` header
//! - OpenAI: `https://api.openai.com/v1/chat/completions`, bearer auth

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::types::{CompletionRequest, ResponseEvent, ResponseStream};
use crate::config::ModelConfig;
use crate::error::{FactoryError, InvocationError};

pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Model or deployment identifier sent to the service.
    fn model_id(&self) -> &str;

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, InvocationError>;
}

/// Builds one client per declared model.
pub trait ChatClientFactory: Send + Sync {
    fn create(&self, key: &str, config: &ModelConfig) -> Result<Arc<dyn ChatClient>, FactoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthStyle {
    Bearer(String),
    ApiKeyHeader(String),
    None,
}

pub struct OpenAiChatClient {
    http: reqwest::Client,
    model: String,
    chat_url: String,
    azure: bool,
    auth: AuthStyle,
}

impl OpenAiChatClient {
    pub fn from_config(key: &str, cfg: &ModelConfig, http: reqwest::Client) -> Self {
        let model = cfg.model.clone().unwrap_or_else(|| key.to_string());
        let (chat_url, azure) = match &cfg.endpoint {
            Some(ep) => (
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    ep.trim_end_matches('/'),
                    model,
                    cfg.api_version
                ),
                true,
            ),
            None => (OPENAI_CHAT_URL.to_string(), false),
        };
        let auth = match (&cfg.api_key, azure) {
            (Some(k), true) => AuthStyle::ApiKeyHeader(k.clone()),
            (Some(k), false) => AuthStyle::Bearer(k.clone()),
            (None, _) => AuthStyle::None,
        };
        Self {
            http,
            model,
            chat_url,
            azure,
            auth,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub(crate) fn build_body(&self, req: &CompletionRequest) -> Value {
        let s = &req.settings;
        let messages: Vec<Value> = req.messages.iter().map(|m| m.to_wire()).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": s.temperature,
        });
        if !self.azure {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(v) = s.top_p {
            body["top_p"] = json!(v);
        }
        if let Some(v) = s.frequency_penalty {
            body["frequency_penalty"] = json!(v);
        }
        if let Some(v) = s.presence_penalty {
            body["presence_penalty"] = json!(v);
        }
        if let Some(v) = s.max_tokens {
            body["max_tokens"] = json!(v);
        }
        if let Some(schema) = &s.response_json_schema {
            body["response_format"] = schema.to_response_format();
        }
        if !req.tools.is_empty() {
            body["tools"] = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description.clone().unwrap_or_default(),
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatClient for OpenAiChatClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, InvocationError> {
        let body = self.build_body(&req);
        debug!(
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );
        trace!(request_body = ?body, "full completion request");

        let mut http_req = self.http.post(&self.chat_url).json(&body);
        http_req = match &self.auth {
            AuthStyle::Bearer(key) => http_req.bearer_auth(key),
            AuthStyle::ApiKeyHeader(key) => http_req.header("api-key", key),
            AuthStyle::None => http_req,
        };
        let resp = http_req
            .send()
            .await
            .map_err(|e| InvocationError::Model(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(InvocationError::Model(format!("error {status}: {text}")));
        }

        let events = resp
            .bytes_stream()
            .scan(Vec::<u8>::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, InvocationError>> = match chunk {
                    Ok(b) => {
                        buf.extend_from_slice(&b);
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(InvocationError::Model(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(events))
    }
}

/// Drain complete `\n`-terminated SSE lines from `buf`, leaving any partial
/// trailing line for the next chunk. Lines are decoded only once complete, so
/// a character split across network chunks survives.
pub(crate) fn drain_complete_sse_lines(
    buf: &mut Vec<u8>,
) -> Vec<Result<ResponseEvent, InvocationError>> {
    let mut events = Vec::new();
    while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=nl).collect();
        let line = match String::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                events.push(Err(InvocationError::Protocol(format!(
                    "stream line is not utf-8: {e}"
                ))));
                continue;
            }
        };
        events.extend(parse_sse_data_line(line.trim_end_matches(['\n', '\r'])));
    }
    events
}

fn parse_sse_data_line(line: &str) -> Vec<Result<ResponseEvent, InvocationError>> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Vec::new();
    };
    if data.is_empty() {
        return Vec::new();
    }
    if data == "[DONE]" {
        return vec![Ok(ResponseEvent::Done)];
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(InvocationError::Protocol(format!(
                "bad stream chunk: {e}"
            )))];
        }
    };
    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return vec![Err(InvocationError::Model(msg.to_string()))];
    }
    parse_sse_chunk(&v).into_iter().map(Ok).collect()
}

fn count(v: &Value) -> u32 {
    v.as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Every event carried by one chunk: text, each tool-call fragment, then usage.
fn parse_sse_chunk(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();
    let delta = &v["choices"][0]["delta"];
    if let Some(text) = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
    {
        events.push(ResponseEvent::TextDelta(text.to_string()));
    }
    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for (pos, tc) in calls.iter().enumerate() {
            let index = match tc.get("index") {
                Some(i) => count(i),
                None => u32::try_from(pos).unwrap_or(u32::MAX),
            };
            events.push(ResponseEvent::ToolCall {
                index,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            });
        }
    }
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(ResponseEvent::Usage {
            input_tokens: count(&usage["prompt_tokens"]),
            output_tokens: count(&usage["completion_tokens"]),
        });
    }
    events
}

/// Creates [`OpenAiChatClient`]s sharing one HTTP connection pool.
#[derive(Clone, Default)]
pub struct OpenAiClientFactory {
    http: reqwest::Client,
}

impl OpenAiClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatClientFactory for OpenAiClientFactory {
    fn create(&self, key: &str, config: &ModelConfig) -> Result<Arc<dyn ChatClient>, FactoryError> {
        if config.api_key.is_none() {
            tracing::warn!(model = %key, "no api key configured; requests will be unauthenticated");
        }
        Ok(Arc::new(OpenAiChatClient::from_config(
            key,
            config,
            self.http.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSettings, ResponseSchema};
    use crate::model::types::{ChatMessage, ToolSpec};

    fn cfg(endpoint: Option<&str>) -> ModelConfig {
        ModelConfig {
            model: Some("gpt-4o".into()),
            api_key: Some("k".into()),
            endpoint: endpoint.map(str::to_string),
            api_version: "2024-06-01".into(),
            cost: None,
            latency: None,
            quality: None,
        }
    }

    #[test]
    fn azure_url_and_auth() {
        let c = OpenAiChatClient::from_config(
            "gpt",
            &cfg(Some("https://acme.openai.azure.com/")),
            reqwest::Client::new(),
        );
        assert_eq!(
            c.chat_url(),
            "https://acme.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(c.auth, AuthStyle::ApiKeyHeader("k".into()));

        let o = OpenAiChatClient::from_config("gpt", &cfg(None), reqwest::Client::new());
        assert_eq!(o.chat_url(), OPENAI_CHAT_URL);
        assert_eq!(o.auth, AuthStyle::Bearer("k".into()));
        assert_eq!(o.model_id(), "gpt-4o");
    }

    #[test]
    fn body_carries_settings_schema_and_tools() {
        let c = OpenAiChatClient::from_config("gpt", &cfg(None), reqwest::Client::new());
        let req = CompletionRequest {
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            tools: vec![ToolSpec {
                name: "time-now".into(),
                description: None,
                parameters: json!({"type": "object", "properties": {}}),
            }],
            settings: ModelSettings {
                temperature: 0.2,
                top_p: Some(0.9),
                max_tokens: Some(50),
                response_json_schema: Some(ResponseSchema {
                    name: "Out".into(),
                    json_schema_definition: json!({"type": "object"}),
                }),
                ..Default::default()
            },
        };
        let body = c.build_body(&req);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert_eq!(body["max_tokens"], 50);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "time-now");
        assert!(body.get("frequency_penalty").is_none());
    }

    #[test]
    fn sse_lines_split_across_chunks() {
        let mut buf = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel".to_vec();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.extend_from_slice(b"lo\"}}]}\n\ndata: [DONE]\n");
        let events: Vec<ResponseEvent> = drain_complete_sse_lines(&mut buf)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![ResponseEvent::TextDelta("Hello".into()), ResponseEvent::Done]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut buf = line[..split].to_vec();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.extend_from_slice(&line[split..]);
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events.into_iter().next().unwrap().unwrap(),
            ResponseEvent::TextDelta("café".into())
        );
    }

    #[tokio::test]
    async fn streamed_reply_keeps_characters_split_by_the_network() {
        use axum::{Router, body::Body, routing::post};

        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks: Vec<Vec<u8>> = vec![
            line[..split].to_vec(),
            line[split..].to_vec(),
            b"data: [DONE]\n".to_vec(),
        ];
        let app = Router::new().route(
            "/openai/deployments/gpt-4o/chat/completions",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    Body::from_stream(futures::stream::iter(
                        chunks.into_iter().map(Ok::<_, std::io::Error>),
                    ))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let endpoint = format!("http://{addr}");
        let client = OpenAiChatClient::from_config("gpt", &cfg(Some(&endpoint)), reqwest::Client::new());
        let req = CompletionRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            settings: ModelSettings::default(),
        };
        let mut stream = client.complete(req).await.unwrap();
        let mut text = String::new();
        while let Some(ev) = stream.next().await {
            match ev.unwrap() {
                ResponseEvent::TextDelta(t) => text.push_str(&t),
                ResponseEvent::Done => break,
                _ => {}
            }
        }
        assert_eq!(text, "café");
    }

    #[test]
    fn invalid_utf8_line_is_a_protocol_error() {
        let mut buf = b"data: \xff\xfe\n".to_vec();
        let ev = drain_complete_sse_lines(&mut buf).pop().unwrap();
        assert!(matches!(ev, Err(InvocationError::Protocol(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_tool_call_and_usage_chunks() {
        let tc = json!({"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_9",
            "function":{"name":"time-now","arguments":"{\"tz\""}}]}}]});
        assert_eq!(
            parse_sse_chunk(&tc),
            vec![ResponseEvent::ToolCall {
                index: 1,
                id: "call_9".into(),
                name: "time-now".into(),
                arguments: "{\"tz\"".into(),
            }]
        );
        let usage = json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 3}});
        assert_eq!(
            parse_sse_chunk(&usage),
            vec![ResponseEvent::Usage {
                input_tokens: 12,
                output_tokens: 3
            }]
        );
    }

    #[test]
    fn every_tool_call_in_one_delta_is_kept() {
        let chunk = json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"a","function":{"name":"time-now","arguments":"{}"}},
            {"index":1,"id":"b","function":{"name":"time-zone","arguments":"{}"}}
        ]}}]});
        let events = parse_sse_chunk(&chunk);
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn content_and_usage_in_one_chunk_both_survive() {
        let chunk = json!({"choices":[{"delta":{"content":"bye"}}],
            "usage":{"prompt_tokens": 5_000_000_000u64, "completion_tokens": 2}});
        assert_eq!(
            parse_sse_chunk(&chunk),
            vec![
                ResponseEvent::TextDelta("bye".into()),
                ResponseEvent::Usage {
                    input_tokens: u32::MAX,
                    output_tokens: 2
                },
            ]
        );
    }

    #[test]
    fn error_chunk_is_a_model_error() {
        let mut buf = b"data: {\"error\":{\"message\":\"rate limited\"}}\n".to_vec();
        let ev = drain_complete_sse_lines(&mut buf).pop().unwrap();
        assert!(matches!(ev, Err(InvocationError::Model(m)) if m == "rate limited"));
    }
}
