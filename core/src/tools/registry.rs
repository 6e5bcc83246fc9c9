//! Tool registry for managing runtime tools

use super::base::{Tool, ToolInfo};
use crate::error::{Result, ToolError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Named collection of live tools shared by the runtime and its agents.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name, replacing any previous one
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!("Registered tool: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().await.remove(name)
    }

    /// Get a tool by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Get a tool by name as its concrete type
    pub async fn get_as<T: Tool>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).await?.into_any().downcast::<T>().ok()
    }

    /// Get a tool or fail with [`ToolError::NotFound`]
    pub async fn require(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.get(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()).into())
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Get list of registered tool names, sorted
    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn infos(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self.tools.read().await.values().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Shut down and remove every tool. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        let tools: Vec<Arc<dyn Tool>> = self.tools.write().await.drain().map(|(_, t)| t).collect();
        for tool in tools {
            match tool.shutdown().await {
                Ok(()) => info!("Tool shut down: {}", tool.name()),
                Err(e) => error!("Error shutting down tool {}: {}", tool.name(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::llm::{LlmTool, MockConnector};
    use std::time::Duration;

    fn mock_tool(name: &str) -> Arc<LlmTool> {
        Arc::new(LlmTool::new(
            name,
            Arc::new(MockConnector::new()),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(mock_tool("llm_tool")).await;

        assert!(registry.has("llm_tool").await);
        assert_eq!(registry.tool_names().await, vec!["llm_tool".to_string()]);
        assert!(registry.require("missing").await.is_err());

        let typed = registry.get_as::<LlmTool>("llm_tool").await;
        assert!(typed.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = ToolRegistry::new();
        registry.register(mock_tool("a")).await;
        registry.register(mock_tool("b")).await;
        assert_eq!(registry.len().await, 2);

        registry.shutdown_all().await;
        assert!(registry.is_empty().await);
    }
}
