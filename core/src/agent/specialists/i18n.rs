//! Localised UI text and the `translate` handler

use crate::agent::context::AgentContext;
use crate::agent::handler::HandlerTable;
use crate::agent::specialist::Specialist;
use crate::error::AgentError;
use crate::messages::{DEFAULT_LANGUAGE, Message, kinds};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const SUPPORTED_LANGUAGES: [&str; 2] = ["zh", "en"];

/// `(key, zh, en)`
const CATALOG: &[(&str, &str, &str)] = &[
    (
        "welcome_title",
        "欢迎使用 Augur 命理解析系统",
        "Welcome to the Augur divination system",
    ),
    ("available_systems", "✨ 可用的占卜系统 ✨", "✨ Available Fortune Systems ✨"),
    ("system_bazi", "八字命理", "BaZi Fortune"),
    ("system_tarot", "塔罗牌", "Tarot Cards"),
    ("system_zodiac", "星座占星", "Western Astrology"),
    (
        "desc_bazi",
        "传统中国八字命理，基于出生年、月、日、时分析命运",
        "Traditional Chinese BaZi reading based on birth year, month, day and hour",
    ),
    (
        "desc_tarot",
        "基于传统塔罗牌解读的占卜系统",
        "Readings based on the traditional tarot deck",
    ),
    (
        "desc_zodiac",
        "基于西方占星学和十二星座的命运分析",
        "Fortune analysis based on Western astrology and the twelve signs",
    ),
    (
        "menu_instruction",
        "请选择:\n• 输入数字 (1/2/3) 选择占卜系统\n• 或直接说 \"八字命理\"、\"塔罗牌\"、\"星座占星\"\n• 输入 \"quit\" 退出系统",
        "Please choose:\n• Enter a number (1/2/3) to pick a system\n• Or just say \"BaZi\", \"Tarot\" or \"Astrology\"\n• Enter \"quit\" to leave",
    ),
    ("bazi_selected", "🀄 已选择八字命理系统", "🀄 BaZi Fortune System Selected"),
    (
        "bazi_birth_date_prompt",
        "请输入您的出生日期 (格式: YYYY-MM-DD，如 1990-01-15):",
        "Please enter your birth date (format: YYYY-MM-DD, e.g. 1990-01-15):",
    ),
    (
        "bazi_birth_time_prompt",
        "请输入您的出生时间 (格式: HH:MM，如 14:30):",
        "Please enter your birth time (format: HH:MM, e.g. 14:30):",
    ),
    (
        "bazi_gender_prompt",
        "请输入您的性别 (男/女):",
        "Please enter your gender (Male/Female):",
    ),
    ("tarot_selected", "🃏 已选择塔罗牌系统", "🃏 Tarot Card System Selected"),
    (
        "tarot_question_prompt",
        "请输入您想要咨询的问题 (如：我的事业发展如何？):",
        "Please enter your question (e.g. How will my career develop?):",
    ),
    (
        "tarot_spread_menu",
        "请选择塔罗牌阵：\n\n1. 🃏 单牌阅读 - 抽取一张牌进行简单的阅读\n2. 🔮 三牌阵 - 过去、现在、未来的经典三牌阵\n3. ✨ 凯尔特十字 - 详细分析当前情况和潜在结果的经典阵列\n4. 💕 关系阵 - 分析两个人之间关系的牌阵\n\n请选择 (1-4):",
        "Please select a tarot spread:\n\n1. 🃏 Single Card - one card for a simple reading\n2. 🔮 Three Card Spread - past, present and future\n3. ✨ Celtic Cross - the current situation and its likely outcome in detail\n4. 💕 Relationship Spread - the bond between two people\n\nPlease select (1-4):",
    ),
    ("zodiac_selected", "⭐ 已选择星座占星系统", "⭐ Western Astrology System Selected"),
    (
        "zodiac_birth_date_prompt",
        "请输入您的出生日期 (格式: YYYY-MM-DD，如 1990-01-15):",
        "Please enter your birth date (format: YYYY-MM-DD, e.g. 1990-01-15):",
    ),
    ("received", "✅ 已记录", "✅ Recorded"),
    ("date_format_error", "❌ 日期格式不正确", "❌ Incorrect date format"),
    ("time_format_error", "❌ 时间格式不正确", "❌ Incorrect time format"),
    ("gender_error", "❌ 请输入 男 或 女", "❌ Please answer Male or Female"),
    ("question_required", "❌ 请输入您的问题", "❌ Please enter your question"),
    ("spread_error", "❌ 请选择有效的牌阵 (1-4)", "❌ Please pick a valid spread (1-4)"),
    ("processing_error", "❌ 处理错误", "❌ Processing error"),
    ("result_title", "🔮 解读结果", "🔮 Reading Results"),
    ("fortune_master", "🧙 命理师: ", "🧙 Fortune Master: "),
    ("quit_message", "系统已安全关闭。感谢使用！", "System closed safely. Thank you!"),
];

/// Catalogue lookup. Unknown languages fall back to Chinese, unknown keys
/// to the key itself.
pub fn text<'a>(key: &'a str, language: &str) -> &'a str {
    let Some((_, zh, en)) = CATALOG.iter().find(|(k, _, _)| *k == key) else {
        return key;
    };
    match normalize_language(language) {
        "en" => en,
        _ => zh,
    }
}

/// Supported language code for `language`, or the default
pub fn normalize_language(language: &str) -> &'static str {
    let lower = language.trim().to_lowercase();
    let primary = lower.split(['-', '_']).next().unwrap_or_default();
    SUPPORTED_LANGUAGES
        .into_iter()
        .find(|code| *code == primary)
        .unwrap_or(DEFAULT_LANGUAGE)
}

/// Answers `translate` requests from the catalogue.
///
/// A request carries either `key` or `keys`; the reply carries `text` or a
/// `texts` map respectively, plus the language actually used.
pub struct I18nSpecialist;

impl I18nSpecialist {
    pub fn new() -> Self {
        Self
    }
}

impl Default for I18nSpecialist {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Specialist for I18nSpecialist {
    fn description(&self) -> &str {
        "Multi-language text resources"
    }

    fn register_handlers(self: Arc<Self>, table: &mut HandlerTable) {
        table.register(kinds::TRANSLATE, |_ctx: AgentContext, msg: Message| async move {
            let language = msg
                .get_str("language")
                .unwrap_or_else(|| msg.language());
            let language = normalize_language(language);

            let mut reply = msg
                .reply(kinds::TRANSLATE_RESPONSE)
                .with_value("language", language);

            if let Some(key) = msg.get_str("key") {
                reply = reply
                    .with_value("key", key)
                    .with_value("text", text(key, language));
            } else if let Some(keys) = msg.get("keys").and_then(Value::as_array) {
                let texts: Map<String, Value> = keys
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|key| (key.to_string(), json!(text(key, language))))
                    .collect();
                reply = reply.with_value("texts", Value::Object(texts));
            } else {
                return Err(AgentError::Validation(
                    "translate needs a key or a keys list".into(),
                ));
            }
            Ok(reply)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_lookup_and_fallbacks() {
        assert_eq!(text("system_tarot", "zh"), "塔罗牌");
        assert_eq!(text("system_tarot", "en"), "Tarot Cards");
        assert_eq!(text("system_tarot", "en-US"), "Tarot Cards");
        assert_eq!(text("system_tarot", "fr"), "塔罗牌");
        assert_eq!(text("no_such_key", "en"), "no_such_key");
    }

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("EN"), "en");
        assert_eq!(normalize_language("zh_CN"), "zh");
        assert_eq!(normalize_language(""), "zh");
    }

    #[test]
    fn test_catalog_keys_are_unique() {
        let mut keys: Vec<&str> = CATALOG.iter().map(|(k, _, _)| *k).collect();
        keys.sort();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }
}
