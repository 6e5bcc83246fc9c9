//! Factories that turn configured class names into agents and tools

use crate::agent::Specialist;
use crate::agent::specialists::{
    ChatSpecialist, DivinationSpecialist, I18nSpecialist, MasterSpecialist,
};
use crate::config::{AgentConfig, ToolConfig};
use crate::divination::FortuneSystem;
use crate::error::{Result, ToolError};
use crate::tools::{LlmTool, Tool};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the specialist for an agent class
pub type SpecialistFactory = Arc<dyn Fn(&AgentConfig) -> Result<Arc<dyn Specialist>> + Send + Sync>;

/// Builds a tool for a tool class
pub type ToolFactory = Arc<dyn Fn(&ToolConfig) -> Result<Arc<dyn Tool>> + Send + Sync>;

/// Class name to factory tables, built once and passed to the runtime.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    agents: HashMap<String, SpecialistFactory>,
    tools: HashMap<String, ToolFactory>,
}

impl ComponentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in agent and tool class
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_agent("master", |config| {
            Ok(Arc::new(MasterSpecialist::from_config(config)) as Arc<dyn Specialist>)
        });
        registry.register_agent("chat", |config| {
            Ok(Arc::new(ChatSpecialist::from_config(config)) as Arc<dyn Specialist>)
        });
        registry.register_agent("i18n", |_| {
            Ok(Arc::new(I18nSpecialist::new()) as Arc<dyn Specialist>)
        });
        for system in FortuneSystem::ALL {
            registry.register_agent(system.as_str(), move |config| {
                Ok(Arc::new(DivinationSpecialist::from_config(system, config)) as Arc<dyn Specialist>)
            });
        }

        registry.register_tool("llm", |config| {
            Ok(Arc::new(LlmTool::from_config(config)?) as Arc<dyn Tool>)
        });

        registry
    }

    pub fn register_agent<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&AgentConfig) -> Result<Arc<dyn Specialist>> + Send + Sync + 'static,
    {
        self.agents.insert(class.into(), Arc::new(factory));
    }

    pub fn register_tool<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&ToolConfig) -> Result<Arc<dyn Tool>> + Send + Sync + 'static,
    {
        self.tools.insert(class.into(), Arc::new(factory));
    }

    pub fn has_agent_class(&self, class: &str) -> bool {
        self.agents.contains_key(class)
    }

    pub fn has_tool_class(&self, class: &str) -> bool {
        self.tools.contains_key(class)
    }

    pub fn build_specialist(&self, config: &AgentConfig) -> Result<Arc<dyn Specialist>> {
        let factory = self
            .agents
            .get(&config.class)
            .ok_or_else(|| ToolError::UnknownClass(format!("agent class {}", config.class)))?;
        factory(config)
    }

    pub fn build_tool(&self, config: &ToolConfig) -> Result<Arc<dyn Tool>> {
        let factory = self
            .tools
            .get(&config.class)
            .ok_or_else(|| ToolError::UnknownClass(format!("tool class {}", config.class)))?;
        factory(config)
    }
}
