//! LLM connector contract and the tool that wraps it

use super::base::{Tool, ToolHealth, ToolInfo};
use crate::config::ToolConfig;
use crate::error::{AgentError, AgentResult, ToolError};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default request timeout in seconds
const DEFAULT_LLM_TIMEOUT: u64 = 60;

/// Text produced by a connector plus provider metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Connector failures
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM connection failed: {0}")]
    Connection(String),

    #[error("LLM provider error: {0}")]
    Provider(String),
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(_) => AgentError::Timeout(err.to_string()),
            LlmError::Connection(_) | LlmError::Provider(_) => {
                AgentError::Connection(err.to_string())
            }
        }
    }
}

/// Stream of text chunks
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

/// A text-generation backend.
///
/// Implementations own their provider's request format; callers only see
/// prompts in and text out.
#[async_trait]
pub trait LlmConnector: Send + Sync {
    fn provider(&self) -> &str;

    async fn generate(&self, system: &str, user: &str) -> Result<Generation, LlmError>;

    /// Stream the reply in chunks. The default yields the whole reply at once.
    async fn generate_streaming(&self, system: &str, user: &str) -> Result<TextStream, LlmError> {
        let generation = self.generate(system, user).await?;
        Ok(stream::once(async move { Ok(generation.text) }).boxed())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Offline connector with canned, deterministic replies
pub struct MockConnector {
    reply: Option<String>,
    failure: Option<LlmError>,
    latency: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            reply: None,
            failure: None,
            latency: Duration::ZERO,
        }
    }

    /// Always answer with `reply`
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Always fail with `error`
    pub fn failing(error: LlmError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn topic(system: &str, user: &str) -> &'static str {
        let mentions = |needle: &str| system.contains(needle) || user.contains(needle);
        if mentions("八字") || mentions("BaZi") {
            "八字命理"
        } else if mentions("塔罗") || mentions("Tarot") {
            "塔罗牌"
        } else if mentions("星座") || mentions("占星") || mentions("Zodiac") {
            "星座占星"
        } else {
            "算命系统"
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmConnector for MockConnector {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn generate(&self, system: &str, user: &str) -> Result<Generation, LlmError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let text = match &self.reply {
            Some(reply) => reply.clone(),
            None => format!(
                "这是一个来自{}的模拟解读结果。配置真实的模型提供商后，这里会显示完整的解读。",
                Self::topic(system, user)
            ),
        };

        let mut generation = Generation::new(text);
        generation.metadata.insert("mock".into(), json!(true));
        generation.metadata.insert("model".into(), json!("mock-model"));
        generation
            .metadata
            .insert("finish_reason".into(), json!("mock_completion"));
        Ok(generation)
    }

    async fn generate_streaming(&self, system: &str, user: &str) -> Result<TextStream, LlmError> {
        let generation = self.generate(system, user).await?;
        let chunks: Vec<Result<String, LlmError>> = generation
            .text
            .chars()
            .collect::<Vec<_>>()
            .chunks(8)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn health_check(&self) -> bool {
        self.failure.is_none()
    }
}

/// Tool exposing an [`LlmConnector`] to agents with a request timeout.
pub struct LlmTool {
    name: String,
    connector: Arc<dyn LlmConnector>,
    timeout: Duration,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl LlmTool {
    pub fn new(name: impl Into<String>, connector: Arc<dyn LlmConnector>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            connector,
            timeout,
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Build from configuration. Only the offline `mock` provider ships in-tree.
    pub fn from_config(config: &ToolConfig) -> Result<Self, ToolError> {
        let provider = config
            .options
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("mock");
        let timeout = config
            .options
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LLM_TIMEOUT);

        let connector: Arc<dyn LlmConnector> = match provider {
            "mock" => {
                let mut mock = MockConnector::new();
                if let Some(reply) = config.options.get("reply").and_then(Value::as_str) {
                    mock = mock.with_reply(reply);
                }
                Arc::new(mock)
            }
            other => {
                return Err(ToolError::Initialization(format!(
                    "unsupported LLM provider: {}",
                    other
                )));
            }
        };

        Ok(Self::new(&config.name, connector, Duration::from_secs(timeout)))
    }

    /// Generate a reply, mapping failures onto agent error kinds
    pub async fn generate_response(&self, system: &str, user: &str) -> AgentResult<Generation> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!("{}: generating with {}", self.name, self.connector.provider());

        let result = match tokio::time::timeout(self.timeout, self.connector.generate(system, user)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        };

        result.map_err(|e| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("{}: generation failed: {}", self.name, e);
            AgentError::from(e)
        })
    }

    /// Streaming variant of [`generate_response`](Self::generate_response)
    pub async fn generate_streaming(&self, system: &str, user: &str) -> AgentResult<TextStream> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(
            self.timeout,
            self.connector.generate_streaming(system, user),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        };

        result.map_err(|e| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            AgentError::from(e)
        })
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Tool for LlmTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            class: "llm".to_string(),
            description: format!("Text generation via the {} provider", self.connector.provider()),
        }
    }

    async fn health_check(&self) -> ToolHealth {
        if self.connector.health_check().await {
            ToolHealth::healthy()
        } else {
            ToolHealth::unhealthy(json!({
                "provider": self.connector.provider(),
                "failures": self.failures.load(Ordering::Relaxed),
            }))
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
