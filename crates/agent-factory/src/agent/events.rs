//! Events emitted while an agent turn runs.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::InvocationError;
use crate::model::ChatMessage;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallEvent {
    pub call_id: String,
    pub function_name: String,
    pub arguments: Value,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl FunctionCallEvent {
    pub fn new(call_id: impl Into<String>, function_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            arguments,
            timestamp: now_secs(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "event_type": "function_call",
            "call_id": self.call_id,
            "function_name": self.function_name,
            "arguments": self.arguments,
            "timestamp": self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResultEvent {
    pub call_id: String,
    pub function_name: String,
    pub result: String,
    pub is_error: bool,
    pub timestamp: f64,
}

impl FunctionResultEvent {
    pub fn new(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
        result: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            result: result.into(),
            is_error,
            timestamp: now_secs(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "event_type": "function_result",
            "call_id": self.call_id,
            "function_name": self.function_name,
            "result": self.result,
            "is_error": self.is_error,
            "timestamp": self.timestamp,
        })
    }
}

/// Final state of a successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    /// Text of the final assistant message.
    pub text: String,
    /// Messages produced this turn, in order, ending with the final reply.
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug)]
pub enum AgentEvent {
    TextDelta(String),
    FunctionCall(FunctionCallEvent),
    FunctionResult(FunctionResultEvent),
    /// Last event of a successful turn.
    Completed(TurnOutput),
    /// Last event of a failed or cancelled turn.
    Failed(InvocationError),
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Completed(_) | AgentEvent::Failed(_))
    }
}
