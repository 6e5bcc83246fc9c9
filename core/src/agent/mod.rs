//! Agents: lifecycle shell, handler dispatch and the built-in specialists

pub mod breaker;
pub mod context;
pub mod handler;
pub mod metrics;
pub mod runner;
pub mod specialist;
pub mod specialists;
pub mod state;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use context::{AgentContext, ToolSet};
pub use handler::{
    ErrorHandler, ErrorHandlers, HandlerTable, MessageHandler, error_payload, error_response,
    payload_of,
};
pub use metrics::AgentMetrics;
pub use runner::{Agent, AgentHealth, AgentStatus};
pub use specialist::Specialist;
pub use state::AgentState;
