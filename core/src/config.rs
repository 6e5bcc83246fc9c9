//! Configuration system for Augur
//!
//! Configuration is a JSON document at `~/.augur/config.json`. Every section
//! has defaults, so a partial file (or none at all) yields a usable runtime
//! with the full set of built-in agents.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable that relocates all runtime data
pub const DATA_DIR_ENV: &str = "AUGUR_DATA_DIR";

/// Runtime-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime name, used in logs and status output
    #[serde(default = "default_runtime_name")]
    pub name: String,
    #[serde(default = "default_runtime_version")]
    pub version: String,
    /// Default per-message handler timeout in seconds
    #[serde(default = "default_message_timeout")]
    pub message_timeout: u64,
    /// Seconds an agent waits for in-flight handlers when stopping
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
    /// Persist agent metrics between runs
    #[serde(default = "default_true")]
    pub state_persistence: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: default_runtime_name(),
            version: default_runtime_version(),
            message_timeout: default_message_timeout(),
            drain_timeout: default_drain_timeout(),
            state_persistence: true,
        }
    }
}

fn default_runtime_name() -> String {
    "augur".to_string()
}

fn default_runtime_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_message_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of messages retained in history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    crate::bus::DEFAULT_HISTORY_LIMIT
}

/// Session store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Directory holding one JSON file per session
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Seconds of inactivity before a session expires
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    /// Seconds between expiry sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Chat turns kept per session
    #[serde(default = "default_max_chat_turns")]
    pub max_chat_turns: usize,
    /// Write sessions to disk
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            session_timeout: default_session_timeout(),
            cleanup_interval: default_cleanup_interval(),
            max_chat_turns: default_max_chat_turns(),
            persist: true,
        }
    }
}

impl SessionsConfig {
    /// Config rooted at `dir`, mostly for tests and embedding
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            storage_path: dir.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        expand_tilde(&self.storage_path)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

fn default_storage_path() -> String {
    "~/.augur/sessions".to_string()
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_chat_turns() -> usize {
    20
}

/// Lifecycle and fault-isolation knobs shared by every agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    /// Consecutive failures that open the circuit breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds the breaker stays open
    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_timeout: u64,
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
    #[serde(default = "default_session_warn_threshold")]
    pub session_warn_threshold: usize,
    /// Inbox poll wait in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Overrides the runtime message timeout for this agent
    #[serde(default)]
    pub message_timeout: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_timeout: default_breaker_reset(),
            queue_warn_threshold: default_queue_warn_threshold(),
            session_warn_threshold: default_session_warn_threshold(),
            poll_interval_ms: default_poll_interval(),
            message_timeout: None,
        }
    }
}

impl AgentSettings {
    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.breaker_threshold == 0 {
            return Err(ConfigError::Invalid("breaker_threshold must be at least 1".into()).into());
        }
        if self.health_check_interval == 0 {
            return Err(ConfigError::Invalid("health_check_interval must be positive".into()).into());
        }
        if self.breaker_reset_timeout == 0 {
            return Err(ConfigError::Invalid("breaker_reset_timeout must be positive".into()).into());
        }
        if self.max_concurrent_handlers == 0 {
            return Err(
                ConfigError::Invalid("max_concurrent_handlers must be at least 1".into()).into(),
            );
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()).into());
        }
        Ok(())
    }
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_concurrent_handlers() -> usize {
    4
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset() -> u64 {
    60
}

fn default_queue_warn_threshold() -> usize {
    100
}

fn default_session_warn_threshold() -> usize {
    50
}

fn default_poll_interval() -> u64 {
    1000
}

/// One agent to instantiate at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Registered agent class, e.g. `master` or `tarot`
    pub class: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub settings: AgentSettings,
    /// Class-specific options
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            auto_start: true,
            settings: AgentSettings::default(),
            options: HashMap::new(),
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// One tool to instantiate at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            options: HashMap::new(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            bus: BusConfig::default(),
            sessions: SessionsConfig::default(),
            agents: default_agents(),
            tools: default_tools(),
        }
    }
}

impl Config {
    /// Check agent settings and name uniqueness
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate agent name: {}", agent.name)).into());
            }
            agent.settings.validate()?;
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate tool name: {}", tool.name)).into());
            }
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.message_timeout)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.drain_timeout)
    }
}

fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig::new("master_agent", "master"),
        AgentConfig::new("i18n_agent", "i18n"),
        AgentConfig::new("bazi_agent", "bazi"),
        AgentConfig::new("tarot_agent", "tarot"),
        AgentConfig::new("zodiac_agent", "zodiac"),
        AgentConfig::new("chat_agent", "chat"),
    ]
}

fn default_tools() -> Vec<ToolConfig> {
    let mut llm = ToolConfig::new("llm_tool", "llm");
    llm.options
        .insert("provider".to_string(), Value::String("mock".to_string()));
    vec![llm]
}

/// Expand tilde in path
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Get the default config directory
pub fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".augur")
}

/// Get the config file path
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.json")
}

/// Get the data directory, honouring `AUGUR_DATA_DIR`
pub fn get_data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => expand_tilde(&dir),
        _ => get_config_dir(),
    }
}

/// Load configuration from the default path
pub async fn load_config() -> Result<Config> {
    load_config_from(&get_config_path()).await
}

/// Load configuration from a file
pub async fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()).into());
    }

    let contents = fs::read_to_string(path).await?;

    let mut config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("Failed to parse config JSON: {}", e)))?;

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply environment variable overrides to config
fn apply_env_overrides(config: &mut Config) {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        let storage = expand_tilde(&dir).join("sessions");
        tracing::debug!("Session storage from environment: {}", storage.display());
        config.sessions.storage_path = storage.to_string_lossy().into_owned();
    }
}

/// Save configuration to the default path
pub async fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &get_config_path()).await
}

/// Save configuration to a file
pub async fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))?;

    fs::write(path, json).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime.message_timeout, 30);
        assert_eq!(config.sessions.session_timeout, 3600);
        assert_eq!(config.sessions.cleanup_interval, 300);
        assert_eq!(config.bus.history_limit, 10_000);
        assert_eq!(config.agents.len(), 6);
        assert_eq!(config.agents[0].name, "master_agent");
        assert_eq!(config.tools[0].name, "llm_tool");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"agents": [{"name": "tarot_agent", "class": "tarot", "settings": {"breaker_threshold": 3}}]}"#,
        )
        .unwrap();
        assert_eq!(config.agents.len(), 1);
        assert!(config.agents[0].auto_start);
        assert_eq!(config.agents[0].settings.breaker_threshold, 3);
        assert_eq!(config.agents[0].settings.breaker_reset_timeout, 60);
        assert_eq!(config.tools.len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.agents[1].settings.breaker_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agents.push(AgentConfig::new("master_agent", "master"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_path_expansion() {
        let sessions = SessionsConfig::default();
        assert!(!sessions.storage_dir().starts_with("~"));
    }

    #[test]
    fn test_config_paths() {
        let config_dir = get_config_dir();
        let config_path = get_config_path();
        assert!(config_path.starts_with(&config_dir));
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.runtime.name = "test-runtime".into();
        save_config_to(&config, &path).await.unwrap();

        let loaded = load_config_from(&path).await.unwrap();
        assert_eq!(loaded.runtime.name, "test-runtime");
        assert_eq!(loaded.agents.len(), config.agents.len());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load_config_from(&dir.path().join("absent.json")).await;
        assert!(matches!(
            err,
            Err(crate::error::AugurError::Config(ConfigError::NotFound(_)))
        ));
    }
}
