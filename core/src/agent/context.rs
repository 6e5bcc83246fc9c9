//! Per-call context handed to message handlers

use crate::bus::MessageBus;
use crate::error::{AgentError, AgentResult};
use crate::messages::Message;
use crate::runtime::RuntimeHandle;
use crate::session::SessionStore;
use crate::tools::Tool;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved tools keyed by name
pub type ToolSet = Arc<HashMap<String, Arc<dyn Tool>>>;

/// What a handler can reach while processing one message: the shared
/// runtime services and the tools its agent resolved at initialisation.
#[derive(Clone)]
pub struct AgentContext {
    agent: String,
    runtime: RuntimeHandle,
    tools: ToolSet,
}

impl AgentContext {
    pub fn new(agent: impl Into<String>, runtime: RuntimeHandle, tools: ToolSet) -> Self {
        Self {
            agent: agent.into(),
            runtime,
            tools,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn bus(&self) -> &MessageBus {
        self.runtime.bus()
    }

    pub fn sessions(&self) -> &SessionStore {
        self.runtime.sessions()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// A resolved tool as its concrete type
    pub fn tool_as<T: Tool>(&self, name: &str) -> AgentResult<Arc<T>> {
        self.tool(name)
            .and_then(|tool| tool.into_any().downcast::<T>().ok())
            .ok_or_else(|| AgentError::Internal(format!("tool {} is not available", name)))
    }

    /// New message from this agent
    pub fn message(&self, kind: impl Into<String>, recipient: impl Into<String>) -> Message {
        Message::new(kind, self.agent.as_str(), recipient)
    }

    /// Call a sibling agent in-process and wait for its reply
    pub async fn request(&self, message: Message) -> Message {
        self.runtime.request(message).await
    }
}
