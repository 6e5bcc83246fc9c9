//! TTL session store with JSON persistence and a small expiring cache

use super::state::{SessionState, SessionUpdate};
use crate::config::SessionsConfig;
use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subdirectory for per-agent snapshots
const AGENTS_DIR: &str = "agents";

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    expired: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

/// Snapshot of store counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub persistence_operations: u64,
    pub persistence_failures: u64,
}

/// Store status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub running: bool,
    pub storage_path: PathBuf,
    pub active_sessions: usize,
    pub cache_entries: usize,
    pub session_timeout: u64,
    pub cleanup_interval: u64,
    pub stats: StoreStats,
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub cache_entries: usize,
}

/// Short description of a session for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: Option<String>,
    pub language: String,
    pub current_system: Option<String>,
    pub readings: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            user_id: state.user_id.clone(),
            language: state.language.clone(),
            current_system: state.current_system.clone(),
            readings: state.fortune_history.len(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Session store shared by the runtime and every agent.
///
/// Sessions live in memory and are mirrored to `{storage}/{id}.json`. A
/// session that is not in memory is rehydrated from disk on first access.
#[derive(Clone)]
pub struct SessionStore {
    storage_path: PathBuf,
    session_timeout: Duration,
    cleanup_interval: Duration,
    max_chat_turns: usize,
    persist: bool,
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    counters: Arc<Counters>,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionStore {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            storage_path: config.storage_dir(),
            session_timeout: config.session_timeout(),
            cleanup_interval: config.cleanup_interval(),
            max_chat_turns: config.max_chat_turns.max(1),
            persist: config.persist,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Create the storage directory and load unexpired sessions from it
    pub async fn initialize(&self) -> Result<()> {
        if !self.persist {
            return Ok(());
        }

        fs::create_dir_all(&self.storage_path).await?;

        let mut entries = fs::read_dir(&self.storage_path).await?;
        let now = Utc::now();
        let mut loaded = 0;
        let mut expired = 0;
        let mut sessions = self.sessions.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match read_session(&path).await {
                Ok(state) if state.is_expired(self.chrono_timeout(), now) => {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!("Failed to remove expired session {}: {}", path.display(), e);
                    }
                    expired += 1;
                }
                Ok(state) => {
                    sessions.insert(state.session_id.clone(), state);
                    loaded += 1;
                }
                Err(e) => error!("Error loading session from {}: {}", path.display(), e),
            }
        }

        info!(
            "Loaded {} persisted session(s), removed {} expired",
            loaded, expired
        );
        Ok(())
    }

    /// Start the periodic expiry sweep
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let store = self.clone();
        let interval = self.cleanup_interval;

        let handle = tokio::spawn(async move {
            info!("Session sweep started (interval: {}s)", interval.as_secs());

            while *store.running.read().await {
                tokio::time::sleep(interval).await;

                if !*store.running.read().await {
                    break;
                }

                let report = store.sweep().await;
                if report.sessions > 0 || report.cache_entries > 0 {
                    info!(
                        "Swept {} expired session(s) and {} cache entr(ies)",
                        report.sessions, report.cache_entries
                    );
                }
            }

            info!("Session sweep stopped");
        });

        *self.task_handle.write().await = Some(handle);
        Ok(())
    }

    /// Stop the sweep and flush every active session to disk
    pub async fn stop(&self) {
        *self.running.write().await = false;

        if let Some(h) = self.task_handle.write().await.take() {
            h.abort();
        }

        let sessions = self.sessions.write().await;
        for state in sessions.values() {
            self.persist_state(state).await;
        }
        info!("Persisted {} active session(s)", sessions.len());
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Create a session and return its id
    pub async fn create(&self, user_id: Option<String>, language: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let state = SessionState::new(&session_id, user_id, language);

        self.persist_state(&state).await;
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), state);
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        debug!("Created session: {}", session_id);
        session_id
    }

    /// Create a session under a caller-chosen id, or return the live one
    pub async fn get_or_create(&self, session_id: &str, language: &str) -> SessionState {
        if let Some(state) = self.get(session_id).await {
            return state;
        }

        let state = SessionState::new(session_id, None, language);
        self.persist_state(&state).await;
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), state.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        state
    }

    /// Fetch a session, refreshing its activity time.
    ///
    /// Sessions not in memory are loaded from disk; expired ones are removed
    /// and reported as absent.
    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();

        if !sessions.contains_key(session_id) {
            let state = self.load_state(session_id).await?;
            sessions.insert(session_id.to_string(), state);
        }

        let state = sessions.get_mut(session_id)?;
        if state.is_expired(self.chrono_timeout(), now) {
            sessions.remove(session_id);
            drop(sessions);
            self.remove_file(session_id).await;
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            debug!("Session expired on access: {}", session_id);
            return None;
        }

        state.updated_at = now;
        Some(state.clone())
    }

    /// Apply a partial update. Persistence happens on a background task.
    pub async fn update(&self, session_id: &str, update: SessionUpdate) -> bool {
        if self.get(session_id).await.is_none() {
            warn!("Session not found: {}", session_id);
            return false;
        }

        {
            let mut sessions = self.sessions.write().await;
            let Some(state) = sessions.get_mut(session_id) else {
                return false;
            };
            update.apply(state, self.max_chat_turns);
            state.updated_at = Utc::now();
        }

        if self.persist {
            let store = self.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                // Holding the read lock keeps a concurrent delete from being undone.
                let sessions = store.sessions.read().await;
                if let Some(state) = sessions.get(&session_id) {
                    store.persist_state(state).await;
                }
            });
        }

        debug!("Updated session: {}", session_id);
        true
    }

    /// Remove a session from memory and disk
    pub async fn delete(&self, session_id: &str) -> bool {
        let in_memory = self.sessions.write().await.remove(session_id).is_some();
        let on_disk = self.remove_file(session_id).await;

        if in_memory || on_disk {
            debug!("Deleted session: {}", session_id);
        }
        in_memory || on_disk
    }

    /// Summaries of every live session, most recently active first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions.values().map(SessionSummary::from).collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cache a value, optionally expiring after `ttl`.
    ///
    /// A `ttl` too large to represent never expires.
    pub async fn cache_set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        self.cache.write().await.insert(key.into(), entry);
    }

    pub async fn cache_get(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.write().await;
        let now = Instant::now();

        match cache.get(key) {
            Some(entry) if entry.is_expired(now) => {
                cache.remove(key);
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn cache_delete(&self, key: &str) -> bool {
        self.cache.write().await.remove(key).is_some()
    }

    /// Evict expired sessions and cache entries
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let timeout = self.chrono_timeout();

        let expired: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired(timeout, now))
                .map(|s| s.session_id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };

        for id in &expired {
            self.remove_file(id).await;
        }
        self.counters
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        let cache_entries = {
            let mut cache = self.cache.write().await;
            let before = cache.len();
            let now = Instant::now();
            cache.retain(|_, entry| !entry.is_expired(now));
            before - cache.len()
        };

        SweepReport {
            sessions: expired.len(),
            cache_entries,
        }
    }

    /// Persist an agent snapshot under `agents/{name}.json`
    pub async fn save_agent_snapshot(&self, agent_name: &str, snapshot: &Value) -> Result<()> {
        let dir = self.storage_path.join(AGENTS_DIR);
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(dir.join(format!("{}.json", safe_filename(agent_name))), json).await?;
        Ok(())
    }

    pub async fn load_agent_snapshot(&self, agent_name: &str) -> Option<Value> {
        let path = self
            .storage_path
            .join(AGENTS_DIR)
            .join(format!("{}.json", safe_filename(agent_name)));

        let contents = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions_created: self.counters.created.load(Ordering::Relaxed),
            sessions_expired: self.counters.expired.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            persistence_operations: self.counters.persisted.load(Ordering::Relaxed),
            persistence_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn status(&self) -> StoreStatus {
        StoreStatus {
            running: self.is_running().await,
            storage_path: self.storage_path.clone(),
            active_sessions: self.sessions.read().await.len(),
            cache_entries: self.cache.read().await.len(),
            session_timeout: self.session_timeout.as_secs(),
            cleanup_interval: self.cleanup_interval.as_secs(),
            stats: self.stats(),
        }
    }

    fn chrono_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.session_timeout).unwrap_or(chrono::Duration::MAX)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.storage_path
            .join(format!("{}.json", safe_filename(session_id)))
    }

    async fn load_state(&self, session_id: &str) -> Option<SessionState> {
        if !self.persist {
            return None;
        }

        let path = self.session_path(session_id);
        match fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Cannot check session file {}: {}", path.display(), e);
                return None;
            }
        }

        match read_session(&path).await {
            Ok(state) => Some(state),
            Err(e) => {
                error!("Error loading session from {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn persist_state(&self, state: &SessionState) {
        if !self.persist {
            return;
        }

        match write_session(&self.session_path(&state.session_id), state).await {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                debug!("Persisted session: {}", state.session_id);
            }
            Err(e) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!("Error persisting session {}: {}", state.session_id, e);
            }
        }
    }

    async fn remove_file(&self, session_id: &str) -> bool {
        if !self.persist {
            return false;
        }
        fs::remove_file(self.session_path(session_id)).await.is_ok()
    }
}

async fn read_session(path: &Path) -> Result<SessionState> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| SessionError::LoadFailed(e.to_string()))?;
    let state = serde_json::from_str(&contents)
        .map_err(|e| SessionError::InvalidFormat(e.to_string()))?;
    Ok(state)
}

async fn write_session(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| SessionError::SaveFailed(e.to_string()))?;
    fs::write(path, json)
        .await
        .map_err(|e| SessionError::SaveFailed(e.to_string()))?;
    Ok(())
}

/// Convert a session id to a safe filename
pub(crate) fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
