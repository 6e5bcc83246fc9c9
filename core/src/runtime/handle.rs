//! Shared services handed to every agent

use crate::agent::{Agent, error_response};
use crate::bus::MessageBus;
use crate::config::RuntimeConfig;
use crate::error::AgentError;
use crate::messages::Message;
use crate::session::SessionStore;
use crate::tools::ToolRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Sender name used on replies the runtime produces itself
pub const RUNTIME_SENDER: &str = "runtime";

/// Cheap, cloneable view of the runtime: bus, session store, tools and the
/// directory of live agents.
#[derive(Clone)]
pub struct RuntimeHandle {
    bus: MessageBus,
    sessions: SessionStore,
    tools: ToolRegistry,
    agents: Arc<RwLock<HashMap<String, Arc<Agent>>>>,
    message_timeout: Duration,
    drain_timeout: Duration,
    persist_state: bool,
}

impl RuntimeHandle {
    pub fn new(
        bus: MessageBus,
        sessions: SessionStore,
        tools: ToolRegistry,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            bus,
            sessions,
            tools,
            agents: Arc::new(RwLock::new(HashMap::new())),
            message_timeout: Duration::from_secs(config.message_timeout),
            drain_timeout: Duration::from_secs(config.drain_timeout),
            persist_state: config.state_persistence,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn persist_state(&self) -> bool {
        self.persist_state
    }

    pub async fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(name).cloned()
    }

    /// Agent names, sorted
    pub async fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) async fn insert_agent(&self, agent: Arc<Agent>) {
        self.agents
            .write()
            .await
            .insert(agent.name().to_string(), agent);
    }

    pub(crate) async fn drain_agents(&self) -> Vec<Arc<Agent>> {
        self.agents.write().await.drain().map(|(_, a)| a).collect()
    }

    /// Hand `message` straight to its recipient and wait for the reply.
    ///
    /// An unknown recipient produces an `unknown_recipient` error reply.
    pub async fn request(&self, message: Message) -> Message {
        match self.agent(message.recipient()).await {
            Some(agent) => {
                debug!(
                    "Request {} from {} to {}",
                    message.kind(),
                    message.sender(),
                    message.recipient()
                );
                agent.handle(message).await
            }
            None => unknown_recipient(&message),
        }
    }
}

/// Error reply for a request nobody can take
pub(crate) fn unknown_recipient(message: &Message) -> Message {
    let err = AgentError::UnknownRecipient(message.recipient().to_string());
    error_response(RUNTIME_SENDER, message, &err)
}
