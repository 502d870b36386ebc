//! Model deployments: registry and selection policy, chat messages, and the
//! streaming chat-completions client.

pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod registry;
pub mod types;

pub use client::{ChatClient, ChatClientFactory, OpenAiChatClient, OpenAiClientFactory};
pub use registry::{ModelRegistry, select_model};
pub use types::*;
