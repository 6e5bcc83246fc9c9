//! Free-form conversation with the fortune master persona

use super::i18n::normalize_language;
use crate::agent::context::AgentContext;
use crate::agent::handler::HandlerTable;
use crate::agent::specialist::Specialist;
use crate::config::AgentConfig;
use crate::divination::FortuneSystem;
use crate::error::{AgentError, AgentResult};
use crate::messages::{Message, kinds};
use crate::session::{SessionState, SessionUpdate};
use crate::tools::LlmTool;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

const DEFAULT_LLM_TOOL: &str = "llm_tool";
const DEFAULT_CONTEXT_TURNS: usize = 10;

pub struct ChatSpecialist {
    llm_tool: String,
    context_turns: usize,
}

impl ChatSpecialist {
    pub fn new() -> Self {
        Self {
            llm_tool: DEFAULT_LLM_TOOL.to_string(),
            context_turns: DEFAULT_CONTEXT_TURNS,
        }
    }

    /// Options: `llm_tool`, `context_turns`
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut specialist = Self::new();
        if let Some(tool) = config.option_str("llm_tool") {
            specialist.llm_tool = tool.to_string();
        }
        if let Some(turns) = config.options.get("context_turns").and_then(Value::as_u64) {
            specialist.context_turns = turns as usize;
        }
        specialist
    }

    fn system_prompt(state: Option<&SessionState>, language: &str) -> String {
        let mut prompt = if language == "en" {
            "You are a friendly fortune master versed in BaZi, tarot and Western astrology. \
             Answer briefly and kindly, and suggest a reading when it would help."
                .to_string()
        } else {
            "你是一位亲切的命理师，精通八字、塔罗和西方占星。请简洁友善地回答，在合适时建议用户进行占卜。"
                .to_string()
        };

        if let Some(reading) = state.and_then(|s| s.last_reading.as_ref()) {
            let summary = reading
                .result
                .get("reading")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if language == "en" {
                prompt.push_str(&format!(
                    "\n\nThe user's latest {} reading:\n{}",
                    reading.system, summary
                ));
            } else {
                prompt.push_str(&format!("\n\n用户最近的{}解读：\n{}", reading.system, summary));
            }
        }
        prompt
    }

    fn user_prompt(&self, state: Option<&SessionState>, text: &str) -> String {
        let mut prompt = String::new();
        if let Some(state) = state {
            let skip = state.chat_context.len().saturating_sub(self.context_turns);
            for turn in state.chat_context.iter().skip(skip) {
                prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
        }
        prompt.push_str(&format!("user: {}", text));
        prompt
    }

    /// Canned reply when the LLM cannot be reached
    fn fallback_reply(text: &str, language: &str) -> String {
        let english = language == "en";
        match (FortuneSystem::detect(text), english) {
            (Some(FortuneSystem::Bazi), false) => {
                "八字命理讲究四柱五行的平衡。输入 1 即可开始八字排盘。".into()
            }
            (Some(FortuneSystem::Bazi), true) => {
                "BaZi is about the balance of the four pillars and five elements. Enter 1 to start a chart.".into()
            }
            (Some(FortuneSystem::Tarot), false) => {
                "塔罗牌能帮助您看清当下的处境。输入 2 即可开始抽牌。".into()
            }
            (Some(FortuneSystem::Tarot), true) => {
                "Tarot can shed light on where you stand. Enter 2 to draw cards.".into()
            }
            (Some(FortuneSystem::Zodiac), false) => {
                "星座反映了性格与天赋。输入 3 即可查看您的星座解读。".into()
            }
            (Some(FortuneSystem::Zodiac), true) => {
                "Your sign reflects character and gifts. Enter 3 for a zodiac reading.".into()
            }
            (None, false) => "我是您的命理师。想了解八字、塔罗还是星座？输入 help 查看菜单。".into(),
            (None, true) => {
                "I am your fortune master. Curious about BaZi, tarot or astrology? Enter help for the menu.".into()
            }
        }
    }
}

impl Default for ChatSpecialist {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Specialist for ChatSpecialist {
    fn description(&self) -> &str {
        "Free conversation about readings and fortune topics"
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.llm_tool.clone()]
    }

    fn register_handlers(self: Arc<Self>, table: &mut HandlerTable) {
        let this = Arc::clone(&self);
        table.register(kinds::CHAT, move |ctx: AgentContext, msg: Message| {
            let this = Arc::clone(&this);
            async move { this.chat(&ctx, &msg).await }
        });
    }
}

impl ChatSpecialist {
    async fn chat(&self, ctx: &AgentContext, msg: &Message) -> AgentResult<Message> {
        let text = msg
            .get_str("message")
            .or_else(|| msg.get_str("content"))
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(AgentError::Validation("chat message is empty".into()));
        }

        let language = normalize_language(msg.language());
        let state = match msg.session_id() {
            Some(session) => Some(ctx.sessions().get_or_create(session, language).await),
            None => None,
        };

        let llm = ctx.tool_as::<LlmTool>(&self.llm_tool)?;
        let (response, fallback) = match llm
            .generate_response(
                &Self::system_prompt(state.as_ref(), language),
                &self.user_prompt(state.as_ref(), text),
            )
            .await
        {
            Ok(generation) => (generation.text, false),
            Err(e) => {
                warn!("{}: LLM unavailable, using canned reply: {}", ctx.agent_name(), e);
                (Self::fallback_reply(text, language), true)
            }
        };

        if let Some(session) = msg.session_id() {
            let update = SessionUpdate::new()
                .push_turn("user", text)
                .push_turn("assistant", &response);
            ctx.sessions().update(session, update).await;
        }

        Ok(msg
            .reply(kinds::CHAT_RESPONSE)
            .with_value("response", response)
            .with_value("session_id", json!(msg.session_id()))
            .with_value("fallback", fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SessionsConfig, ToolConfig};
    use crate::runtime::Runtime;
    use tempfile::TempDir;

    async fn runtime(dir: &TempDir, reply: &str) -> Runtime {
        let mut config = Config::default();
        config.sessions = SessionsConfig::in_dir(dir.path());
        let mut llm = ToolConfig::new("llm_tool", "llm");
        llm.options.insert("reply".into(), json!(reply));
        config.tools = vec![llm];

        let runtime = Runtime::new(config);
        runtime.initialize().await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn test_chat_records_both_turns() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir, "星象显示一切顺利").await;
        let session = runtime.sessions().create(None, "zh").await;

        let reply = runtime
            .request(
                Message::new(kinds::CHAT, "client", "chat_agent")
                    .with_session(&session)
                    .with_value("message", "最近运势怎么样？"),
            )
            .await;
        assert_eq!(reply.kind(), kinds::CHAT_RESPONSE);
        assert_eq!(reply.get_str("response"), Some("星象显示一切顺利"));
        assert_eq!(reply.get_str("session_id"), Some(session.as_str()));

        let state = runtime.sessions().get(&session).await.unwrap();
        assert_eq!(state.chat_context.len(), 2);
        assert_eq!(state.chat_context[0].role, "user");
        assert_eq!(state.chat_context[1].content, "星象显示一切顺利");

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir, "ok").await;

        let reply = runtime
            .request(Message::new(kinds::CHAT, "client", "chat_agent").with_value("message", "  "))
            .await;
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);

        runtime.stop().await.unwrap();
    }

    #[test]
    fn test_prompt_uses_recent_turns_only() {
        let mut specialist = ChatSpecialist::new();
        specialist.context_turns = 2;

        let mut state = SessionState::new("s", None, "zh");
        SessionUpdate::new()
            .push_turn("user", "one")
            .push_turn("assistant", "two")
            .push_turn("user", "three")
            .apply(&mut state, 20);

        let prompt = specialist.user_prompt(Some(&state), "four");
        assert!(!prompt.contains("one"));
        assert!(prompt.contains("assistant: two"));
        assert!(prompt.ends_with("user: four"));
    }

    #[test]
    fn test_fallback_reply_points_at_menu() {
        assert!(ChatSpecialist::fallback_reply("塔罗准吗", "zh").contains('2'));
        assert!(ChatSpecialist::fallback_reply("hello", "en").contains("help"));
    }
}
