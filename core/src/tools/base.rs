//! Tool trait shared by every runtime tool

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

/// Static description of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub class: String,
    pub description: String,
}

/// Result of a tool health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHealth {
    pub healthy: bool,
    #[serde(default)]
    pub details: Value,
}

impl ToolHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            details: Value::Null,
        }
    }

    pub fn unhealthy(details: impl Into<Value>) -> Self {
        Self {
            healthy: false,
            details: details.into(),
        }
    }
}

/// A shared capability agents borrow from the runtime, such as an LLM client.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn info(&self) -> ToolInfo;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> ToolHealth {
        ToolHealth::healthy()
    }

    /// Upcast used for typed lookups through the registry
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
