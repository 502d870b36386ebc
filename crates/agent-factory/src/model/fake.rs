//! Scripted chat clients for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use super::client::{ChatClient, ChatClientFactory};
use super::types::{CompletionRequest, ResponseEvent, ResponseStream};
use crate::config::ModelConfig;
use crate::error::{FactoryError, InvocationError};

/// Replays one scripted response per `complete` call. When the script runs
/// out it answers with `"done"`.
pub struct ScriptedClient {
    model: String,
    script: Mutex<VecDeque<Vec<ResponseEvent>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    event_delay: Option<Duration>,
}

impl ScriptedClient {
    pub fn new(model: &str, script: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            model: model.to_string(),
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            event_delay: None,
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn text_reply(text: &str) -> Vec<ResponseEvent> {
    vec![ResponseEvent::TextDelta(text.to_string()), ResponseEvent::Done]
}

pub fn tool_call_reply(calls: &[(&str, &str, &str)]) -> Vec<ResponseEvent> {
    let mut events: Vec<ResponseEvent> = calls
        .iter()
        .enumerate()
        .map(|(i, (id, name, args))| ResponseEvent::ToolCall {
            index: i as u32,
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        })
        .collect();
    events.push(ResponseEvent::Done);
    events
}

#[async_trait::async_trait]
impl ChatClient for ScriptedClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, InvocationError> {
        self.requests.lock().unwrap().push(req);
        let events = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_reply("done"));
        let delay = self.event_delay;
        let stream = futures::stream::iter(events).then(move |ev| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(ev)
        });
        Ok(Box::pin(stream))
    }
}

/// Hands out the same shared client for every model key.
pub struct SharedClientFactory(pub Arc<ScriptedClient>);

impl ChatClientFactory for SharedClientFactory {
    fn create(&self, _key: &str, _config: &ModelConfig) -> Result<Arc<dyn ChatClient>, FactoryError> {
        Ok(self.0.clone())
    }
}
