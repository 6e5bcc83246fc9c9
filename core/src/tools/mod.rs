//! Tools shared by agents
//!
//! Tools are long-lived capabilities owned by the runtime, such as the LLM
//! client. Agents name the tools they need and borrow them at initialisation.

pub mod base;
pub mod llm;
pub mod registry;

pub use base::{Tool, ToolHealth, ToolInfo};
pub use llm::{Generation, LlmConnector, LlmError, LlmTool, MockConnector, TextStream};
pub use registry::ToolRegistry;
