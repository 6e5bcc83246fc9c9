//! Message envelope exchanged between agents over the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Key/value body of a message
pub type Payload = HashMap<String, Value>;

/// Language used when a message does not name one
pub const DEFAULT_LANGUAGE: &str = "zh";

/// Well-known message type tags
pub mod kinds {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const HEALTH_CHECK: &str = "health_check";
    pub const HEALTH_CHECK_RESPONSE: &str = "health_check_response";
    pub const GET_STATUS: &str = "get_status";
    pub const STATUS_RESPONSE: &str = "status_response";
    pub const ERROR_RESPONSE: &str = "error_response";
    pub const VALIDATION_ERROR_RESPONSE: &str = "validation_error_response";
    pub const TIMEOUT_ERROR_RESPONSE: &str = "timeout_error_response";
    pub const CONNECTION_ERROR_RESPONSE: &str = "connection_error_response";
    pub const USER_INTERACTION: &str = "user_interaction";
    pub const FORTUNE_REQUEST: &str = "fortune_request";
    pub const FORTUNE_RESPONSE: &str = "fortune_response";
    pub const INPUT_PROMPT: &str = "input_prompt";
    pub const SYSTEM_MENU: &str = "system_menu";
    pub const AGENT_REGISTRATION: &str = "agent_registration";
    pub const REGISTRATION_SUCCESS: &str = "registration_success";
    pub const CHAT: &str = "chat";
    pub const CHAT_RESPONSE: &str = "chat_response";
    pub const TRANSLATE: &str = "translate";
    pub const TRANSLATE_RESPONSE: &str = "translate_response";
}

/// Delivery priority of a message
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

/// A message routed between agents.
///
/// Identity fields are assigned at construction and only readable afterwards;
/// the builder methods consume the message so it cannot be altered once it has
/// been handed to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: String,
    sender: String,
    recipient: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    correlation_id: String,
    message_id: String,
    #[serde(default)]
    priority: MessagePriority,
    #[serde(default)]
    retry_count: u32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_max_retries() -> u32 {
    3
}

impl Message {
    /// Create a new message with fresh message and correlation ids
    pub fn new(
        kind: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            session_id: None,
            language: default_language(),
            payload: Payload::new(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            priority: MessagePriority::default(),
            retry_count: 0,
            max_retries: default_max_retries(),
            timeout: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Insert a single payload entry
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Copy of this message for the next delivery attempt, if any remain
    pub fn retried(&self) -> Option<Self> {
        if self.retry_count >= self.max_retries {
            return None;
        }
        let mut next = self.clone();
        next.retry_count += 1;
        next.message_id = Uuid::new_v4().to_string();
        next.timestamp = Utc::now();
        Some(next)
    }

    /// Build a response addressed back to the sender.
    ///
    /// The reply keeps the session, language and correlation id of the request.
    pub fn reply(&self, kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
            session_id: self.session_id.clone(),
            language: self.language.clone(),
            payload: Payload::new(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            timeout: None,
        }
    }

    /// Clone for another recipient with a new message id
    pub fn redirect(&self, recipient: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.recipient = recipient.into();
        copy.message_id = Uuid::new_v4().to_string();
        copy
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// String payload entry, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn priority(&self) -> MessagePriority {
        self.priority
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether this message touches the given agent as sender or recipient
    pub fn involves(&self, agent: &str) -> bool {
        self.sender == agent || self.recipient == agent
    }
}
