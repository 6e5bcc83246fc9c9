//! Handler tables: message-type dispatch and typed error replies

use super::context::AgentContext;
use crate::error::{AgentError, AgentResult, ErrorKind};
use crate::messages::{Message, Payload, kinds};
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Async handler for one message type
pub type MessageHandler =
    Arc<dyn Fn(AgentContext, Message) -> BoxFuture<'static, AgentResult<Message>> + Send + Sync>;

/// Builds the reply for a failed message: `(agent, request, error)`
pub type ErrorHandler = Arc<dyn Fn(&str, &Message, &AgentError) -> Message + Send + Sync>;

/// Message type to handler mapping
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, MessageHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous handler
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(AgentContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentResult<Message>> + Send + 'static,
    {
        self.handlers
            .insert(kind.into(), Arc::new(move |ctx, msg| Box::pin(handler(ctx, msg))));
    }

    pub fn unregister(&mut self, kind: &str) -> bool {
        self.handlers.remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> Option<MessageHandler> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered message types, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Error kind to reply-builder mapping
#[derive(Clone)]
pub struct ErrorHandlers {
    handlers: HashMap<ErrorKind, ErrorHandler>,
}

impl ErrorHandlers {
    /// Replies for validation, timeout and connection failures
    pub fn with_defaults() -> Self {
        let mut handlers = Self {
            handlers: HashMap::new(),
        };

        handlers.register(ErrorKind::Validation, |agent, msg, err| {
            let mut payload = error_payload(agent, err);
            payload.insert("details".into(), json!(err.to_string()));
            payload.insert(
                "suggestions".into(),
                json!(["Check the input format", "Make sure every required field is filled in"]),
            );
            msg.reply(kinds::VALIDATION_ERROR_RESPONSE).with_payload(payload)
        });

        handlers.register(ErrorKind::Timeout, |agent, msg, err| {
            let mut payload = error_payload(agent, err);
            payload.insert("retry_suggested".into(), json!(true));
            msg.reply(kinds::TIMEOUT_ERROR_RESPONSE).with_payload(payload)
        });

        handlers.register(ErrorKind::Connection, |agent, msg, err| {
            let mut payload = error_payload(agent, err);
            payload.insert("retry_suggested".into(), json!(true));
            msg.reply(kinds::CONNECTION_ERROR_RESPONSE).with_payload(payload)
        });

        handlers
    }

    pub fn register<F>(&mut self, kind: ErrorKind, handler: F)
    where
        F: Fn(&str, &Message, &AgentError) -> Message + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    /// Reply for `error`, falling back to the generic error response
    pub fn respond(&self, agent: &str, message: &Message, error: &AgentError) -> Message {
        match self.handlers.get(&error.kind()) {
            Some(handler) => handler(agent, message, error),
            None => error_response(agent, message, error),
        }
    }
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Fields every error reply carries
pub fn error_payload(agent: &str, error: &AgentError) -> Payload {
    let mut payload = Payload::new();
    payload.insert("error".into(), json!(error.to_string()));
    payload.insert("error_type".into(), json!(error.kind().as_str()));
    payload.insert("agent".into(), json!(agent));
    payload.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    payload.insert("recoverable".into(), json!(error.is_recoverable()));
    payload
}

/// Generic `error_response` reply
pub fn error_response(agent: &str, message: &Message, error: &AgentError) -> Message {
    message
        .reply(kinds::ERROR_RESPONSE)
        .with_payload(error_payload(agent, error))
}

/// Serialize a struct into a message payload
pub fn payload_of<T: Serialize>(value: &T) -> AgentResult<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => {
            let mut payload = Payload::new();
            payload.insert("value".into(), other);
            Ok(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_error_handlers() {
        let handlers = ErrorHandlers::with_defaults();
        let request = Message::new(kinds::FORTUNE_REQUEST, "master_agent", "bazi_agent");

        let reply = handlers.respond(
            "bazi_agent",
            &request,
            &AgentError::Validation("birth_date missing".into()),
        );
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);
        assert_eq!(reply.recipient(), "master_agent");
        assert_eq!(reply.correlation_id(), request.correlation_id());
        assert_eq!(reply.get("recoverable"), Some(&json!(false)));
        assert!(reply.get("suggestions").is_some());

        let reply = handlers.respond("bazi_agent", &request, &AgentError::Timeout("llm".into()));
        assert_eq!(reply.kind(), kinds::TIMEOUT_ERROR_RESPONSE);
        assert_eq!(reply.get("recoverable"), Some(&json!(true)));

        let reply = handlers.respond("bazi_agent", &request, &AgentError::Internal("boom".into()));
        assert_eq!(reply.kind(), kinds::ERROR_RESPONSE);
        for key in ["error", "error_type", "agent", "timestamp", "recoverable"] {
            assert!(reply.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(reply.get_str("error_type"), Some("internal"));
    }

    #[test]
    fn test_custom_error_handler_overrides() {
        let mut handlers = ErrorHandlers::with_defaults();
        handlers.register(ErrorKind::Internal, |_, msg, _| msg.reply("custom_failure"));

        let request = Message::new("x", "a", "b");
        let reply = handlers.respond("b", &request, &AgentError::Internal("boom".into()));
        assert_eq!(reply.kind(), "custom_failure");
    }

    #[test]
    fn test_handler_table_registration() {
        let mut table = HandlerTable::new();
        table.register(kinds::PING, |_ctx, msg: Message| async move { Ok(msg.reply(kinds::PONG)) });
        table.register("other", |_ctx, msg: Message| async move { Ok(msg.reply("x")) });

        assert!(table.contains(kinds::PING));
        assert_eq!(table.kinds(), vec!["other".to_string(), "ping".to_string()]);
        assert!(table.unregister("other"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_payload_of_struct() {
        #[derive(Serialize)]
        struct Report {
            healthy: bool,
        }
        let payload = payload_of(&Report { healthy: true }).unwrap();
        assert_eq!(payload["healthy"], json!(true));
    }
}
