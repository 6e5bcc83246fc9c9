//! Augur Core Library
//!
//! Multi-agent fortune-telling runtime: the message envelope and bus, the
//! session store, the generic agent shell with its circuit breaker and
//! metrics, the runtime that supervises the agent roster, and the BaZi,
//! tarot and zodiac calculators behind the divination agents.

pub mod agent;
pub mod bus;
pub mod config;
pub mod divination;
pub mod error;
pub mod messages;
pub mod runtime;
pub mod session;
pub mod tools;

// Re-exports for convenience
pub use agent::{Agent, AgentState, Specialist};
pub use bus::MessageBus;
pub use config::{
    AgentConfig, AgentSettings, BusConfig, Config, RuntimeConfig, SessionsConfig, ToolConfig,
    get_config_dir, get_config_path, get_data_dir, load_config, save_config,
};
pub use divination::FortuneSystem;
pub use error::*;
pub use messages::{Message, Payload, kinds};
pub use runtime::{ComponentRegistry, Runtime, RuntimeHandle, RuntimeStatus};
pub use session::{SessionState, SessionStore, SessionUpdate};
pub use tools::{LlmTool, ToolRegistry};
