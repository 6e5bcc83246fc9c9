//! Runtime supervisor: builds, starts and stops every component

mod handle;
mod registry;

pub use handle::{RUNTIME_SENDER, RuntimeHandle};
pub use registry::{ComponentRegistry, SpecialistFactory, ToolFactory};

use crate::agent::{Agent, AgentHealth, AgentStatus};
use crate::bus::{BusStatus, MessageBus};
use crate::config::Config;
use crate::error::Result;
use crate::messages::Message;
use crate::session::{SessionStore, StoreStatus};
use crate::tools::{Tool, ToolInfo, ToolRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Status and health of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub status: AgentStatus,
    pub health: AgentHealth,
}

/// Full runtime status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub name: String,
    pub version: String,
    pub initialized: bool,
    pub running: bool,
    pub agents: BTreeMap<String, AgentReport>,
    pub tools: Vec<ToolInfo>,
    pub message_bus: BusStatus,
    pub session_store: StoreStatus,
}

#[derive(Default)]
struct Flags {
    initialized: bool,
    running: bool,
}

/// Owns the bus, the session store, the tools and the agents.
///
/// Individual agent or tool failures are logged and skipped; they never
/// stop the rest of the runtime from coming up or going down.
#[derive(Clone)]
pub struct Runtime {
    config: Config,
    registry: Arc<ComponentRegistry>,
    handle: RuntimeHandle,
    /// Agent names in configuration order
    order: Arc<RwLock<Vec<String>>>,
    flags: Arc<RwLock<Flags>>,
}

impl Runtime {
    /// Runtime with the built-in component classes
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, ComponentRegistry::with_builtins())
    }

    pub fn with_registry(config: Config, registry: ComponentRegistry) -> Self {
        let bus = MessageBus::with_history_limit(config.bus.history_limit);
        let sessions = SessionStore::new(&config.sessions);
        let handle = RuntimeHandle::new(bus, sessions, ToolRegistry::new(), &config.runtime);

        Self {
            config,
            registry: Arc::new(registry),
            handle,
            order: Arc::new(RwLock::new(Vec::new())),
            flags: Arc::new(RwLock::new(Flags::default())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    pub fn bus(&self) -> &MessageBus {
        self.handle.bus()
    }

    pub fn sessions(&self) -> &SessionStore {
        self.handle.sessions()
    }

    /// Prepare storage and build every configured tool and agent
    pub async fn initialize(&self) -> Result<()> {
        if self.flags.read().await.initialized {
            return Ok(());
        }
        info!("Initializing {} runtime", self.config.runtime.name);

        self.config.validate()?;
        self.sessions().initialize().await?;

        for tool_config in &self.config.tools {
            match self.registry.build_tool(tool_config) {
                Ok(tool) => {
                    if let Err(e) = tool.initialize().await {
                        error!("Failed to initialize tool {}: {}", tool_config.name, e);
                        continue;
                    }
                    self.handle.tools().register(tool).await;
                    info!("Created tool: {} ({})", tool_config.name, tool_config.class);
                }
                Err(e) => error!("Failed to create tool {}: {}", tool_config.name, e),
            }
        }

        let mut order = Vec::new();
        for agent_config in &self.config.agents {
            let specialist = match self.registry.build_specialist(agent_config) {
                Ok(specialist) => specialist,
                Err(e) => {
                    error!("Failed to create agent {}: {}", agent_config.name, e);
                    continue;
                }
            };

            let agent = Agent::new(agent_config, specialist, self.handle.clone());
            if let Err(e) = agent.initialize().await {
                error!("Failed to initialize agent {}: {}", agent_config.name, e);
                if let Err(e) = agent.shutdown().await {
                    warn!("Cleanup of agent {} failed: {}", agent_config.name, e);
                }
                continue;
            }

            self.handle.insert_agent(agent).await;
            order.push(agent_config.name.clone());
            info!("Created agent: {} ({})", agent_config.name, agent_config.class);
        }
        *self.order.write().await = order;

        self.flags.write().await.initialized = true;
        info!("Runtime initialized");
        Ok(())
    }

    /// Start the bus, the session store and every auto-start agent
    pub async fn start(&self) -> Result<()> {
        if !self.flags.read().await.initialized {
            self.initialize().await?;
        }
        if self.flags.read().await.running {
            return Ok(());
        }

        self.bus().start().await;
        self.sessions().start().await?;

        let order = self.order.read().await.clone();
        for name in order {
            let Some(agent) = self.handle.agent(&name).await else {
                continue;
            };
            let auto_start = self
                .config
                .agents
                .iter()
                .find(|a| a.name == name)
                .is_some_and(|a| a.auto_start);
            if !auto_start {
                continue;
            }
            match agent.start().await {
                Ok(()) => info!("Started agent: {}", name),
                Err(e) => error!("Failed to start agent {}: {}", name, e),
            }
        }

        self.flags.write().await.running = true;
        info!("Runtime started");
        Ok(())
    }

    /// Shut everything down. Each agent is stopped independently.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping runtime");

        for agent in self.handle.drain_agents().await {
            if let Err(e) = agent.shutdown().await {
                error!("Error stopping agent {}: {}", agent.name(), e);
            }
        }
        self.order.write().await.clear();

        self.handle.tools().shutdown_all().await;
        self.sessions().stop().await;
        self.bus().stop().await;

        let mut flags = self.flags.write().await;
        flags.running = false;
        flags.initialized = false;

        info!("Runtime stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.flags.read().await.running
    }

    pub async fn get_agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.handle.agent(name).await
    }

    pub async fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.handle.tools().get(name).await
    }

    pub async fn list_agents(&self) -> Vec<String> {
        self.handle.agent_names().await
    }

    pub async fn list_tools(&self) -> Vec<String> {
        self.handle.tools().tool_names().await
    }

    /// Call an agent in-process and wait for its reply
    pub async fn request(&self, message: Message) -> Message {
        self.handle.request(message).await
    }

    /// Call an agent, resending while the reply reports a recoverable error
    /// and the message still has retries left
    pub async fn request_with_retry(&self, message: Message) -> Message {
        let mut current = message;
        loop {
            let reply = self.request(current.clone()).await;
            if !is_recoverable_error(&reply) {
                return reply;
            }
            match current.retried() {
                Some(next) => {
                    warn!(
                        "Retrying {} to {} (attempt {})",
                        next.kind(),
                        next.recipient(),
                        next.retry_count()
                    );
                    current = next;
                }
                None => return reply,
            }
        }
    }

    /// Queue a message on the bus for asynchronous delivery
    pub async fn dispatch(&self, message: Message) -> bool {
        self.bus().send(message).await
    }

    pub async fn status(&self) -> RuntimeStatus {
        let mut agents = BTreeMap::new();
        for name in self.handle.agent_names().await {
            if let Some(agent) = self.handle.agent(&name).await {
                agents.insert(
                    name,
                    AgentReport {
                        status: agent.status(),
                        health: agent.health().await,
                    },
                );
            }
        }

        let flags = self.flags.read().await;
        RuntimeStatus {
            name: self.config.runtime.name.clone(),
            version: self.config.runtime.version.clone(),
            initialized: flags.initialized,
            running: flags.running,
            agents,
            tools: self.handle.tools().infos().await,
            message_bus: self.bus().status().await,
            session_store: self.sessions().status().await,
        }
    }
}

fn is_recoverable_error(reply: &Message) -> bool {
    reply.get("error_type").is_some()
        && reply
            .get("recoverable")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::config::{AgentConfig, SessionsConfig};
    use crate::error::ErrorKind;
    use crate::messages::kinds;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.sessions = SessionsConfig::in_dir(dir.path());
        for agent in &mut config.agents {
            agent.settings.poll_interval_ms = 20;
        }
        config
    }

    #[tokio::test]
    async fn test_start_and_stop_default_roster() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config(&dir));
        runtime.start().await.unwrap();

        assert!(runtime.is_running().await);
        assert_eq!(runtime.list_agents().await.len(), 6);
        assert_eq!(runtime.list_tools().await, vec!["llm_tool".to_string()]);

        let status = runtime.status().await;
        assert!(status.message_bus.running);
        assert_eq!(status.agents["bazi_agent"].status.state, AgentState::Idle);

        let master = runtime.get_agent("master_agent").await.unwrap();
        runtime.stop().await.unwrap();
        assert_eq!(master.state(), AgentState::Shutdown);
        assert!(runtime.list_agents().await.is_empty());
        assert!(!runtime.bus().is_running().await);
    }

    #[tokio::test]
    async fn test_ping_round_trip_over_bus() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config(&dir));
        runtime.start().await.unwrap();

        let client_id = runtime.bus().subscribe("client", |_| async { Ok(()) }).await;
        let ping = Message::new(kinds::PING, "client", "tarot_agent");
        let correlation = ping.correlation_id().to_string();
        assert!(runtime.dispatch(ping).await);

        let reply = runtime
            .bus()
            .receive("client", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.kind(), kinds::PONG);
        assert_eq!(reply.sender(), "tarot_agent");
        assert_eq!(reply.correlation_id(), correlation);

        runtime.bus().unsubscribe("client", client_id).await;
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_recipient_request() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config(&dir));
        runtime.initialize().await.unwrap();

        let reply = runtime
            .request(Message::new(kinds::PING, "client", "oracle_agent"))
            .await;
        assert_eq!(reply.kind(), kinds::ERROR_RESPONSE);
        assert_eq!(
            reply.get_str("error_type"),
            Some(ErrorKind::UnknownRecipient.as_str())
        );
        assert_eq!(reply.recipient(), "client");

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_class_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.agents.push(AgentConfig::new("oracle_agent", "oracle"));
        let runtime = Runtime::new(config);
        runtime.start().await.unwrap();

        assert!(runtime.get_agent("oracle_agent").await.is_none());
        assert!(runtime.get_agent("master_agent").await.is_some());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_tool_fails_only_that_agent() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.tools.clear();
        let runtime = Runtime::new(config);
        runtime.start().await.unwrap();

        assert!(runtime.get_agent("chat_agent").await.is_none());
        assert!(runtime.get_agent("i18n_agent").await.is_some());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_agent_is_not_auto_started() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        if let Some(agent) = config.agents.iter_mut().find(|a| a.name == "zodiac_agent") {
            agent.auto_start = false;
        }
        let runtime = Runtime::new(config);
        runtime.start().await.unwrap();

        // Not started means no inbox loop, but direct requests still work.
        let zodiac = runtime.get_agent("zodiac_agent").await.unwrap();
        assert_eq!(zodiac.state(), AgentState::Idle);
        let reply = runtime
            .request(Message::new(kinds::PING, "client", "zodiac_agent"))
            .await;
        assert_eq!(reply.kind(), kinds::PONG);
        assert!(reply.get("timestamp").is_some());

        runtime.stop().await.unwrap();
    }

    #[test]
    fn test_recoverable_error_detection() {
        let request = Message::new(kinds::CHAT, "client", "chat_agent");
        let timeout = request
            .reply(kinds::TIMEOUT_ERROR_RESPONSE)
            .with_value("error_type", "timeout")
            .with_value("recoverable", json!(true));
        assert!(is_recoverable_error(&timeout));
        assert!(!is_recoverable_error(&handle::unknown_recipient(&request)));
        assert!(!is_recoverable_error(&request.reply(kinds::CHAT_RESPONSE)));
    }
}
