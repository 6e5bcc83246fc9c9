//! Domain calculators behind the divination agents.
//!
//! Calculators are pure: payload in, payload out, no I/O. The agents wrap
//! them with validation, caching, session bookkeeping and the LLM reading.

pub mod bazi;
pub mod tarot;
pub mod zodiac;

pub use bazi::BaziCalculator;
pub use tarot::{Spread, TarotCalculator};
pub use zodiac::ZodiacCalculator;

use crate::error::AgentError;
use crate::messages::Payload;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Input problems a calculator can report
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalcError {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl CalcError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CalcError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The payload key the error is about
    pub fn field(&self) -> &str {
        match self {
            CalcError::MissingField(field) => field,
            CalcError::InvalidField { field, .. } => field,
        }
    }
}

impl From<CalcError> for AgentError {
    fn from(err: CalcError) -> Self {
        AgentError::Validation(err.to_string())
    }
}

/// A fortune-telling computation
pub trait Calculator: Send + Sync {
    fn system(&self) -> FortuneSystem;

    /// Payload keys that must be present before [`calculate`](Self::calculate)
    fn required_fields(&self) -> &'static [&'static str];

    fn calculate(&self, input: &Payload) -> Result<Payload, CalcError>;
}

/// The divination systems on offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FortuneSystem {
    Bazi,
    Tarot,
    Zodiac,
}

impl FortuneSystem {
    /// Menu order
    pub const ALL: [FortuneSystem; 3] = [FortuneSystem::Bazi, FortuneSystem::Tarot, FortuneSystem::Zodiac];

    pub fn as_str(&self) -> &'static str {
        match self {
            FortuneSystem::Bazi => "bazi",
            FortuneSystem::Tarot => "tarot",
            FortuneSystem::Zodiac => "zodiac",
        }
    }

    /// Default name of the agent serving this system
    pub fn agent_name(&self) -> String {
        format!("{}_agent", self.as_str())
    }

    /// Position in the numbered menu, starting at 1
    pub fn menu_number(&self) -> usize {
        match self {
            FortuneSystem::Bazi => 1,
            FortuneSystem::Tarot => 2,
            FortuneSystem::Zodiac => 3,
        }
    }

    pub fn from_menu_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(FortuneSystem::Bazi),
            "2" => Some(FortuneSystem::Tarot),
            "3" => Some(FortuneSystem::Zodiac),
            _ => None,
        }
    }

    /// Words that select this system from free text
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            FortuneSystem::Bazi => &["八字", "命理", "生辰", "四柱", "五行", "bazi"],
            FortuneSystem::Tarot => &["塔罗", "抽牌", "占卜", "tarot"],
            FortuneSystem::Zodiac => &["星座", "占星", "星盘", "星象", "zodiac", "astrology", "horoscope"],
        }
    }

    /// First system whose keywords appear in `text`
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|system| system.keywords().iter().any(|k| lower.contains(k)))
    }

    pub fn calculator(&self) -> Box<dyn Calculator> {
        match self {
            FortuneSystem::Bazi => Box::new(BaziCalculator),
            FortuneSystem::Tarot => Box::new(TarotCalculator),
            FortuneSystem::Zodiac => Box::new(ZodiacCalculator::new()),
        }
    }
}

impl fmt::Display for FortuneSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FortuneSystem {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bazi" => Ok(FortuneSystem::Bazi),
            "tarot" => Ok(FortuneSystem::Tarot),
            "zodiac" => Ok(FortuneSystem::Zodiac),
            other => Err(CalcError::invalid("system", format!("unknown system {}", other))),
        }
    }
}

/// Non-empty string field
pub fn field_str<'a>(input: &'a Payload, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn require_str<'a>(input: &'a Payload, key: &str) -> Result<&'a str, CalcError> {
    field_str(input, key).ok_or_else(|| CalcError::MissingField(key.to_string()))
}

/// `YYYY-MM-DD`
pub fn parse_date(field: &str, text: &str) -> Result<NaiveDate, CalcError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| CalcError::invalid(field, format!("{} (expected YYYY-MM-DD): {}", text, e)))
}

/// `HH:MM`, hour may be a single digit
pub fn parse_time(field: &str, text: &str) -> Result<NaiveTime, CalcError> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|e| CalcError::invalid(field, format!("{} (expected HH:MM): {}", text, e)))
}

pub fn is_date(text: &str) -> bool {
    let text = text.trim();
    text.len() == 10 && parse_date("date", text).is_ok()
}

pub fn is_time(text: &str) -> bool {
    parse_time("time", text).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_and_keywords() {
        assert_eq!(FortuneSystem::from_menu_choice(" 2 "), Some(FortuneSystem::Tarot));
        assert_eq!(FortuneSystem::from_menu_choice("4"), None);
        assert_eq!(FortuneSystem::detect("我想算八字"), Some(FortuneSystem::Bazi));
        assert_eq!(FortuneSystem::detect("Show me my Horoscope"), Some(FortuneSystem::Zodiac));
        assert_eq!(FortuneSystem::detect("hello"), None);
        for system in FortuneSystem::ALL {
            assert_eq!(FortuneSystem::from_menu_choice(&system.menu_number().to_string()), Some(system));
            assert_eq!(system.as_str().parse::<FortuneSystem>().unwrap(), system);
            assert_eq!(system.calculator().system(), system);
        }
    }

    #[test]
    fn test_date_and_time_helpers() {
        assert!(is_date("1990-01-15"));
        assert!(!is_date("1990-1-5"));
        assert!(!is_date("1990-02-30"));
        assert!(is_time("9:05"));
        assert!(is_time("14:30"));
        assert!(!is_time("25:00"));

        let err = parse_date("birth_date", "yesterday").unwrap_err();
        assert_eq!(err.field(), "birth_date");
        assert_eq!(
            AgentError::from(err).kind(),
            crate::error::ErrorKind::Validation
        );
    }
}
