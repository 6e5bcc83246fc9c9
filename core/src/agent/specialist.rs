//! The domain half of an agent

use super::context::AgentContext;
use super::handler::HandlerTable;
use crate::error::{AgentError, AgentResult};
use crate::messages::{Message, Payload};
use async_trait::async_trait;
use std::sync::Arc;

/// Domain behaviour plugged into the generic [`Agent`](super::Agent) shell.
///
/// The shell owns lifecycle, concurrency and fault isolation. A specialist
/// contributes message handlers and, for message types without a handler,
/// the three-stage `validate -> process -> generate` pipeline.
#[async_trait]
pub trait Specialist: Send + Sync + 'static {
    fn description(&self) -> &str;

    /// Tool names that must be registered before the agent can initialise
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }

    fn register_handlers(self: Arc<Self>, _table: &mut HandlerTable) {}

    async fn on_initialize(&self, _ctx: &AgentContext) -> AgentResult<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &AgentContext) -> AgentResult<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &AgentContext) {}

    async fn on_shutdown(&self, _ctx: &AgentContext) {}

    async fn validate(&self, _ctx: &AgentContext, message: &Message) -> AgentResult<Payload> {
        Ok(message.payload().clone())
    }

    async fn process(
        &self,
        _ctx: &AgentContext,
        message: &Message,
        _input: Payload,
    ) -> AgentResult<Payload> {
        Err(AgentError::Validation(format!(
            "unsupported message type: {}",
            message.kind()
        )))
    }

    async fn generate(
        &self,
        _ctx: &AgentContext,
        _message: &Message,
        output: Payload,
    ) -> AgentResult<Payload> {
        Ok(output)
    }
}
