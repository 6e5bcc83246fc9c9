//! Error types for Augur

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for Augur operations
pub type Result<T> = std::result::Result<T, AugurError>;

/// Result type returned by agent handlers
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Main error type for Augur
#[derive(Error, Debug)]
pub enum AugurError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session store errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Agent errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Tool errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load session: {0}")]
    LoadFailed(String),

    #[error("Failed to save session: {0}")]
    SaveFailed(String),

    #[error("Invalid session format: {0}")]
    InvalidFormat(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Tool errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Unknown tool class: {0}")]
    UnknownClass(String),

    #[error("Tool initialization failed: {0}")]
    Initialization(String),
}

/// Category of a failure inside an agent.
///
/// The kind decides which error handler builds the reply and whether the
/// caller is told the failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Connection,
    State,
    CircuitOpen,
    UnknownRecipient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::State => "state",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::UnknownRecipient => "unknown_recipient",
            ErrorKind::Internal => "internal",
        }
    }

    /// Transient failures a caller may retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-related errors
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid agent state: {0}")]
    State(String),

    #[error("Circuit breaker open for agent {0}")]
    CircuitOpen(String),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Validation(_) => ErrorKind::Validation,
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::Connection(_) => ErrorKind::Connection,
            AgentError::State(_) => ErrorKind::State,
            AgentError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            AgentError::UnknownRecipient(_) => ErrorKind::UnknownRecipient,
            AgentError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

impl From<anyhow::Error> for AugurError {
    fn from(err: anyhow::Error) -> Self {
        AugurError::Other(err.to_string())
    }
}

impl From<serde_json::Error> for AugurError {
    fn from(err: serde_json::Error) -> Self {
        AugurError::Other(format!("JSON error: {}", err))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Internal(format!("JSON error: {}", err))
    }
}
