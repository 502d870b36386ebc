//! Agents: the tool-calling turn loop, the factory that builds them, and
//! conversation history.

pub mod chat_agent;
pub mod events;
pub mod factory;
pub mod history;

pub use chat_agent::{Agent, AgentEventStream, MAX_TOOL_ROUNDS};
pub use events::{AgentEvent, FunctionCallEvent, FunctionResultEvent, TurnOutput};
pub use factory::AgentFactory;
pub use history::{ChatHistory, HistoryReducer, estimate_tokens};
