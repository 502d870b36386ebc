//! Agent-interop HTTP service: capability cards, synchronous and streaming
//! invocation, task cancellation.

pub mod card;
pub mod executor;
pub mod protocol;
pub mod routes;

pub use card::AgentCard;
pub use executor::AgentExecutor;
pub use routes::{router, serve};
