//! Session records and typed partial updates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Readings kept per session before the oldest are dropped
pub const MAX_FORTUNE_HISTORY: usize = 50;

/// One turn of free-form conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A completed divination reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub system: String,
    pub result: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Data being collected from the user before a reading can run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intake {
    pub system: String,
    #[serde(default)]
    pub collected: BTreeMap<String, String>,
}

impl Intake {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            collected: BTreeMap::new(),
        }
    }
}

/// Per-conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub current_system: Option<String>,
    #[serde(default)]
    pub last_reading: Option<Reading>,
    #[serde(default)]
    pub chat_context: Vec<ChatTurn>,
    #[serde(default)]
    pub fortune_history: Vec<Reading>,
    #[serde(default)]
    pub preferences: HashMap<String, Value>,
    #[serde(default)]
    pub intake: Option<Intake>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    crate::messages::DEFAULT_LANGUAGE.to_string()
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        language: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id,
            language: language.into(),
            current_system: None,
            last_reading: None,
            chat_context: Vec::new(),
            fortune_history: Vec::new(),
            preferences: HashMap::new(),
            intake: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Idle longer than `timeout`
    pub fn is_expired(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.updated_at > timeout
    }
}

/// Partial update applied to a [`SessionState`].
///
/// Fields left unset are not touched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    user_id: Option<String>,
    language: Option<String>,
    current_system: Option<Option<String>>,
    intake: Option<Option<Intake>>,
    turns: Vec<ChatTurn>,
    reading: Option<Reading>,
    preferences: HashMap<String, Value>,
    clear_chat: bool,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn current_system(mut self, system: Option<String>) -> Self {
        self.current_system = Some(system);
        self
    }

    pub fn intake(mut self, intake: Option<Intake>) -> Self {
        self.intake = Some(intake);
        self
    }

    pub fn push_turn(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.turns.push(ChatTurn::new(role, content));
        self
    }

    /// Store a finished reading as the latest and append it to the history
    pub fn record_reading(mut self, system: impl Into<String>, result: Value) -> Self {
        self.reading = Some(Reading {
            system: system.into(),
            result,
            timestamp: Utc::now(),
        });
        self
    }

    pub fn preference(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.preferences.insert(key.into(), value.into());
        self
    }

    pub fn clear_chat(mut self) -> Self {
        self.clear_chat = true;
        self
    }

    /// Merge into `state`, keeping at most `max_chat_turns` turns of context
    pub fn apply(self, state: &mut SessionState, max_chat_turns: usize) {
        if let Some(user_id) = self.user_id {
            state.user_id = Some(user_id);
        }
        if let Some(language) = self.language {
            state.language = language;
        }
        if let Some(system) = self.current_system {
            state.current_system = system;
        }
        if let Some(intake) = self.intake {
            state.intake = intake;
        }
        if self.clear_chat {
            state.chat_context.clear();
        }

        state.chat_context.extend(self.turns);
        if state.chat_context.len() > max_chat_turns {
            let excess = state.chat_context.len() - max_chat_turns;
            state.chat_context.drain(..excess);
        }

        if let Some(reading) = self.reading {
            state.current_system = Some(reading.system.clone());
            state.fortune_history.push(reading.clone());
            if state.fortune_history.len() > MAX_FORTUNE_HISTORY {
                state.fortune_history.remove(0);
            }
            state.last_reading = Some(reading);
        }

        state.preferences.extend(self.preferences);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_context_is_bounded() {
        let mut state = SessionState::new("s", None, "zh");
        for i in 0..5 {
            SessionUpdate::new()
                .push_turn("user", format!("q{}", i))
                .push_turn("assistant", format!("a{}", i))
                .apply(&mut state, 4);
        }
        assert_eq!(state.chat_context.len(), 4);
        assert_eq!(state.chat_context[0].content, "q3");
        assert_eq!(state.chat_context[3].content, "a4");
    }

    #[test]
    fn test_record_reading_sets_last_and_history() {
        let mut state = SessionState::new("s", Some("u".into()), "en");
        SessionUpdate::new()
            .record_reading("tarot", json!({"cards": ["The Fool"]}))
            .apply(&mut state, 20);

        assert_eq!(state.current_system.as_deref(), Some("tarot"));
        assert_eq!(state.fortune_history.len(), 1);
        let last = state.last_reading.unwrap();
        assert_eq!(last.result["cards"][0], json!("The Fool"));
    }

    #[test]
    fn test_unset_fields_untouched() {
        let mut state = SessionState::new("s", None, "zh");
        state.current_system = Some("bazi".into());
        state.intake = Some(Intake::new("bazi"));

        SessionUpdate::new().language("en").apply(&mut state, 20);
        assert_eq!(state.language, "en");
        assert_eq!(state.current_system.as_deref(), Some("bazi"));
        assert!(state.intake.is_some());

        SessionUpdate::new().intake(None).apply(&mut state, 20);
        assert!(state.intake.is_none());
    }

    #[test]
    fn test_expiry() {
        let mut state = SessionState::new("s", None, "zh");
        let now = Utc::now();
        state.updated_at = now - chrono::Duration::seconds(120);
        assert!(state.is_expired(chrono::Duration::seconds(60), now));
        assert!(!state.is_expired(chrono::Duration::seconds(600), now));
    }
}
