//! Entry agent: menu, step-by-step input collection and routing to the
//! divination and chat agents.

use super::i18n::{self, normalize_language};
use crate::agent::context::AgentContext;
use crate::agent::handler::HandlerTable;
use crate::agent::specialist::Specialist;
use crate::config::AgentConfig;
use crate::divination::{FortuneSystem, Spread, is_date, is_time};
use crate::error::{AgentError, AgentResult};
use crate::messages::{Message, Payload, kinds};
use crate::session::{Intake, SessionUpdate};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const MENU_WORDS: &[&str] = &["", "help", "menu", "start", "帮助", "菜单", "开始"];
const CANCEL_WORDS: &[&str] = &["back", "cancel", "返回", "取消"];

/// One piece of input collected from the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    BirthDate,
    BirthTime,
    Gender,
    Question,
    Spread,
}

impl Field {
    /// Collection order per system
    fn for_system(system: FortuneSystem) -> &'static [Field] {
        match system {
            FortuneSystem::Bazi => &[Field::BirthDate, Field::BirthTime, Field::Gender],
            FortuneSystem::Tarot => &[Field::Question, Field::Spread],
            FortuneSystem::Zodiac => &[Field::BirthDate],
        }
    }

    /// Payload key the value is sent under
    fn key(&self) -> &'static str {
        match self {
            Field::BirthDate => "birth_date",
            Field::BirthTime => "birth_time",
            Field::Gender => "gender",
            Field::Question => "question",
            Field::Spread => "spread_type",
        }
    }

    fn prompt_key(&self, system: FortuneSystem) -> &'static str {
        match (self, system) {
            (Field::BirthDate, FortuneSystem::Zodiac) => "zodiac_birth_date_prompt",
            (Field::BirthDate, _) => "bazi_birth_date_prompt",
            (Field::BirthTime, _) => "bazi_birth_time_prompt",
            (Field::Gender, _) => "bazi_gender_prompt",
            (Field::Question, _) => "tarot_question_prompt",
            (Field::Spread, _) => "tarot_spread_menu",
        }
    }

    fn error_key(&self) -> &'static str {
        match self {
            Field::BirthDate => "date_format_error",
            Field::BirthTime => "time_format_error",
            Field::Gender => "gender_error",
            Field::Question => "question_required",
            Field::Spread => "spread_error",
        }
    }

    /// Normalised value, or `None` when the input does not fit
    fn parse(&self, input: &str) -> Option<String> {
        let input = input.trim();
        match self {
            Field::BirthDate => is_date(input).then(|| input.to_string()),
            Field::BirthTime => is_time(input).then(|| input.to_string()),
            Field::Gender => match input.to_lowercase().as_str() {
                "男" | "男性" | "male" | "m" => Some("男".to_string()),
                "女" | "女性" | "female" | "f" => Some("女".to_string()),
                _ => None,
            },
            Field::Question => (!input.is_empty()).then(|| input.to_string()),
            Field::Spread => Spread::from_menu_choice(input)
                .or_else(|| Spread::parse(input))
                .map(|spread| spread.key().to_string()),
        }
    }
}

fn selected_key(system: FortuneSystem) -> &'static str {
    match system {
        FortuneSystem::Bazi => "bazi_selected",
        FortuneSystem::Tarot => "tarot_selected",
        FortuneSystem::Zodiac => "zodiac_selected",
    }
}

fn icon(system: FortuneSystem) -> &'static str {
    match system {
        FortuneSystem::Bazi => "🀄",
        FortuneSystem::Tarot => "🃏",
        FortuneSystem::Zodiac => "⭐",
    }
}

fn lookup<'a>(texts: &'a HashMap<String, String>, key: &'a str) -> &'a str {
    texts.get(key).map(String::as_str).unwrap_or(key)
}

pub struct MasterSpecialist {
    i18n_agent: String,
    chat_agent: String,
    system_agents: HashMap<FortuneSystem, String>,
    registered: RwLock<BTreeMap<String, String>>,
}

impl MasterSpecialist {
    pub fn new() -> Self {
        Self {
            i18n_agent: "i18n_agent".to_string(),
            chat_agent: "chat_agent".to_string(),
            system_agents: FortuneSystem::ALL
                .into_iter()
                .map(|system| (system, system.agent_name()))
                .collect(),
            registered: RwLock::new(BTreeMap::new()),
        }
    }

    /// Options: `i18n_agent`, `chat_agent`, `bazi_agent`, `tarot_agent`,
    /// `zodiac_agent`
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut specialist = Self::new();
        if let Some(name) = config.option_str("i18n_agent") {
            specialist.i18n_agent = name.to_string();
        }
        if let Some(name) = config.option_str("chat_agent") {
            specialist.chat_agent = name.to_string();
        }
        for system in FortuneSystem::ALL {
            if let Some(name) = config.option_str(&system.agent_name()) {
                specialist.system_agents.insert(system, name.to_string());
            }
        }
        specialist
    }

    fn agent_for(&self, system: FortuneSystem) -> String {
        self.system_agents
            .get(&system)
            .cloned()
            .unwrap_or_else(|| system.agent_name())
    }

    /// Agents that announced themselves, name to type
    pub async fn registered_agents(&self) -> BTreeMap<String, String> {
        self.registered.read().await.clone()
    }

    /// Texts for `keys` from the i18n agent, filled in locally where it
    /// cannot answer
    async fn texts(
        &self,
        ctx: &AgentContext,
        keys: &[&str],
        language: &str,
    ) -> HashMap<String, String> {
        let request = ctx
            .message(kinds::TRANSLATE, &self.i18n_agent)
            .with_language(language)
            .with_value("keys", json!(keys));
        let reply = ctx.request(request).await;
        let remote = if reply.kind() == kinds::TRANSLATE_RESPONSE {
            reply.get("texts").and_then(Value::as_object).cloned()
        } else {
            debug!("{}: i18n unavailable: {}", ctx.agent_name(), reply.kind());
            None
        };

        keys.iter()
            .map(|key| {
                let text = remote
                    .as_ref()
                    .and_then(|texts| texts.get(*key))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| i18n::text(key, language).to_string());
                (key.to_string(), text)
            })
            .collect()
    }

    async fn session_for(&self, ctx: &AgentContext, msg: &Message, language: &str) -> String {
        match msg.session_id() {
            Some(id) => id.to_string(),
            None => ctx.sessions().create(None, language).await,
        }
    }

    async fn user_interaction(&self, ctx: &AgentContext, msg: &Message) -> AgentResult<Message> {
        let content = msg
            .get_str("content")
            .or_else(|| msg.get_str("message"))
            .map(str::trim)
            .unwrap_or_default();
        let language = normalize_language(msg.language());
        let session_id = self.session_for(ctx, msg, language).await;
        let state = ctx.sessions().get_or_create(&session_id, language).await;
        let lower = content.to_lowercase();

        if let Some(intake) = state.intake {
            if CANCEL_WORDS.contains(&lower.as_str()) {
                ctx.sessions()
                    .update(&session_id, SessionUpdate::new().intake(None))
                    .await;
                return Ok(self.menu(ctx, msg, &session_id, language).await);
            }
            return self
                .continue_intake(ctx, msg, &session_id, intake, content, language)
                .await;
        }

        if MENU_WORDS.contains(&lower.as_str()) {
            return Ok(self.menu(ctx, msg, &session_id, language).await);
        }

        if let Some(system) =
            FortuneSystem::from_menu_choice(content).or_else(|| FortuneSystem::detect(content))
        {
            return Ok(self.begin_intake(ctx, msg, &session_id, system, language).await);
        }

        if ctx.runtime().agent(&self.chat_agent).await.is_some() {
            let request = ctx
                .message(kinds::CHAT, &self.chat_agent)
                .with_session(&session_id)
                .with_language(language)
                .with_value("message", content);
            let reply = ctx.request(request).await;
            return Ok(msg
                .reply(reply.kind())
                .with_session(&session_id)
                .with_payload(reply.payload().clone()));
        }

        Ok(self.menu(ctx, msg, &session_id, language).await)
    }

    async fn menu(
        &self,
        ctx: &AgentContext,
        msg: &Message,
        session_id: &str,
        language: &str,
    ) -> Message {
        let mut keys = vec!["welcome_title", "available_systems", "menu_instruction"];
        for system in FortuneSystem::ALL {
            keys.push(match system {
                FortuneSystem::Bazi => "system_bazi",
                FortuneSystem::Tarot => "system_tarot",
                FortuneSystem::Zodiac => "system_zodiac",
            });
            keys.push(match system {
                FortuneSystem::Bazi => "desc_bazi",
                FortuneSystem::Tarot => "desc_tarot",
                FortuneSystem::Zodiac => "desc_zodiac",
            });
        }
        let texts = self.texts(ctx, &keys, language).await;

        let mut menu = format!(
            "{}\n\n{}\n",
            lookup(&texts, "welcome_title"),
            lookup(&texts, "available_systems")
        );
        let mut systems = Vec::new();
        for system in FortuneSystem::ALL {
            let name = lookup(&texts, &format!("system_{}", system)).to_string();
            let description = lookup(&texts, &format!("desc_{}", system)).to_string();
            menu.push_str(&format!(
                "\n{}. {} {} - {}",
                system.menu_number(),
                icon(system),
                name,
                description
            ));
            systems.push(json!({
                "number": system.menu_number(),
                "system": system,
                "name": name,
                "description": description,
            }));
        }
        menu.push_str(&format!("\n\n{}", lookup(&texts, "menu_instruction")));

        msg.reply(kinds::SYSTEM_MENU)
            .with_session(session_id)
            .with_value("menu", menu)
            .with_value("available_systems", Value::Array(systems))
    }

    async fn begin_intake(
        &self,
        ctx: &AgentContext,
        msg: &Message,
        session_id: &str,
        system: FortuneSystem,
        language: &str,
    ) -> Message {
        let field = Field::for_system(system)[0];
        ctx.sessions()
            .update(
                session_id,
                SessionUpdate::new()
                    .current_system(Some(system.as_str().to_string()))
                    .intake(Some(Intake::new(system.as_str()))),
            )
            .await;

        let prompt_key = field.prompt_key(system);
        let texts = self
            .texts(ctx, &[selected_key(system), prompt_key], language)
            .await;
        let text = format!(
            "{}\n\n{}",
            lookup(&texts, selected_key(system)),
            lookup(&texts, prompt_key)
        );
        Self::prompt(msg, session_id, system, field, text, false)
    }

    async fn continue_intake(
        &self,
        ctx: &AgentContext,
        msg: &Message,
        session_id: &str,
        mut intake: Intake,
        content: &str,
        language: &str,
    ) -> AgentResult<Message> {
        let Ok(system) = intake.system.parse::<FortuneSystem>() else {
            ctx.sessions()
                .update(session_id, SessionUpdate::new().intake(None))
                .await;
            return Ok(self.menu(ctx, msg, session_id, language).await);
        };
        let fields = Field::for_system(system);
        let pending = |intake: &Intake| {
            fields
                .iter()
                .copied()
                .find(|field| !intake.collected.contains_key(field.key()))
        };

        if let Some(field) = pending(&intake) {
            let Some(value) = field.parse(content) else {
                let prompt_key = field.prompt_key(system);
                let texts = self
                    .texts(ctx, &[field.error_key(), prompt_key], language)
                    .await;
                let text = format!(
                    "{}\n{}",
                    lookup(&texts, field.error_key()),
                    lookup(&texts, prompt_key)
                );
                return Ok(Self::prompt(msg, session_id, system, field, text, true));
            };
            intake.collected.insert(field.key().to_string(), value);
        }

        if let Some(next) = pending(&intake) {
            ctx.sessions()
                .update(session_id, SessionUpdate::new().intake(Some(intake)))
                .await;
            let prompt_key = next.prompt_key(system);
            let texts = self.texts(ctx, &["received", prompt_key], language).await;
            let text = format!(
                "{}\n\n{}",
                lookup(&texts, "received"),
                lookup(&texts, prompt_key)
            );
            return Ok(Self::prompt(msg, session_id, system, next, text, false));
        }

        ctx.sessions()
            .update(session_id, SessionUpdate::new().intake(None))
            .await;
        let payload: Payload = intake
            .collected
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        self.run_reading(ctx, msg, session_id, system, payload, language)
            .await
    }

    fn prompt(
        msg: &Message,
        session_id: &str,
        system: FortuneSystem,
        field: Field,
        text: String,
        error: bool,
    ) -> Message {
        msg.reply(kinds::INPUT_PROMPT)
            .with_session(session_id)
            .with_value("message", text)
            .with_value("system", system.as_str())
            .with_value("next_field", field.key())
            .with_value("error", error)
    }

    /// Ask the system's agent for a reading and wrap its answer
    async fn run_reading(
        &self,
        ctx: &AgentContext,
        msg: &Message,
        session_id: &str,
        system: FortuneSystem,
        payload: Payload,
        language: &str,
    ) -> AgentResult<Message> {
        let target = self.agent_for(system);
        info!("{}: routing {} reading to {}", ctx.agent_name(), system, target);

        let request = ctx
            .message(kinds::FORTUNE_REQUEST, &target)
            .with_session(session_id)
            .with_language(language)
            .with_payload(payload);
        let reply = ctx.request(request).await;

        if reply.get("error_type").is_some() {
            return Ok(msg
                .reply(reply.kind())
                .with_session(session_id)
                .with_payload(reply.payload().clone())
                .with_value("system", system.as_str())
                .with_value("success", false));
        }

        Ok(msg
            .reply(kinds::FORTUNE_RESPONSE)
            .with_session(session_id)
            .with_value("system", system.as_str())
            .with_value("success", true)
            .with_value("reading", reply.get("reading").cloned().unwrap_or(Value::Null))
            .with_value("result", reply.get("result").cloned().unwrap_or(Value::Null)))
    }

    async fn fortune_request(&self, ctx: &AgentContext, msg: &Message) -> AgentResult<Message> {
        let system: FortuneSystem = msg
            .get_str("system_type")
            .ok_or_else(|| AgentError::Validation("system_type is required".into()))?
            .parse()?;
        let language = normalize_language(msg.language());
        let session_id = self.session_for(ctx, msg, language).await;

        let mut payload = msg.payload().clone();
        payload.remove("system_type");
        self.run_reading(ctx, msg, &session_id, system, payload, language)
            .await
    }

    async fn agent_registration(&self, ctx: &AgentContext, msg: &Message) -> AgentResult<Message> {
        let (Some(name), Some(agent_type)) = (msg.get_str("agent_name"), msg.get_str("agent_type"))
        else {
            return Err(AgentError::Validation(
                "agent_name and agent_type are required".into(),
            ));
        };

        self.registered
            .write()
            .await
            .insert(name.to_string(), agent_type.to_string());
        info!("{}: registered {} ({})", ctx.agent_name(), name, agent_type);

        Ok(msg
            .reply(kinds::REGISTRATION_SUCCESS)
            .with_value("status", "registered")
            .with_value("agent_name", name)
            .with_value("agent_type", agent_type))
    }
}

impl Default for MasterSpecialist {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Specialist for MasterSpecialist {
    fn description(&self) -> &str {
        "Menu, input collection and routing"
    }

    fn register_handlers(self: Arc<Self>, table: &mut HandlerTable) {
        let this = Arc::clone(&self);
        table.register(kinds::USER_INTERACTION, move |ctx: AgentContext, msg: Message| {
            let this = Arc::clone(&this);
            async move { this.user_interaction(&ctx, &msg).await }
        });

        let this = Arc::clone(&self);
        table.register(kinds::FORTUNE_REQUEST, move |ctx: AgentContext, msg: Message| {
            let this = Arc::clone(&this);
            async move { this.fortune_request(&ctx, &msg).await }
        });

        let this = Arc::clone(&self);
        table.register(kinds::AGENT_REGISTRATION, move |ctx: AgentContext, msg: Message| {
            let this = Arc::clone(&this);
            async move { this.agent_registration(&ctx, &msg).await }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SessionsConfig};
    use crate::runtime::Runtime;
    use tempfile::TempDir;

    async fn runtime(dir: &TempDir) -> Runtime {
        let mut config = Config::default();
        config.sessions = SessionsConfig::in_dir(dir.path());
        let runtime = Runtime::new(config);
        runtime.initialize().await.unwrap();
        runtime
    }

    async fn say(runtime: &Runtime, session: &str, content: &str) -> Message {
        runtime
            .request(
                Message::new(kinds::USER_INTERACTION, "client", "master_agent")
                    .with_session(session)
                    .with_value("content", content),
            )
            .await
    }

    #[test]
    fn test_field_parsing() {
        assert_eq!(Field::BirthDate.parse(" 1990-01-15 "), Some("1990-01-15".into()));
        assert_eq!(Field::BirthDate.parse("1990/01/15"), None);
        assert_eq!(Field::BirthTime.parse("9:05"), Some("9:05".into()));
        assert_eq!(Field::Gender.parse("Female"), Some("女".into()));
        assert_eq!(Field::Gender.parse("x"), None);
        assert_eq!(Field::Spread.parse("3"), Some("celtic_cross".into()));
        assert_eq!(Field::Spread.parse("7"), None);
        assert_eq!(Field::Question.parse("   "), None);
    }

    #[tokio::test]
    async fn test_menu_on_help() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = say(&runtime, "s1", "help").await;
        assert_eq!(reply.kind(), kinds::SYSTEM_MENU);
        assert_eq!(reply.session_id(), Some("s1"));
        assert!(reply.get_str("menu").unwrap().contains("八字命理"));
        assert_eq!(reply.get("available_systems").unwrap().as_array().unwrap().len(), 3);

        let english = runtime
            .request(
                Message::new(kinds::USER_INTERACTION, "client", "master_agent")
                    .with_session("s2")
                    .with_language("en")
                    .with_value("content", "menu"),
            )
            .await;
        assert!(english.get_str("menu").unwrap().contains("Tarot Cards"));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tarot_conversation() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = say(&runtime, "s1", "2").await;
        assert_eq!(reply.kind(), kinds::INPUT_PROMPT);
        assert_eq!(reply.get_str("next_field"), Some("question"));

        let reply = say(&runtime, "s1", "我的事业发展如何？").await;
        assert_eq!(reply.get_str("next_field"), Some("spread_type"));

        let reply = say(&runtime, "s1", "9").await;
        assert_eq!(reply.get("error"), Some(&json!(true)));
        assert_eq!(reply.get_str("next_field"), Some("spread_type"));

        let reply = say(&runtime, "s1", "2").await;
        assert_eq!(reply.kind(), kinds::FORTUNE_RESPONSE);
        assert_eq!(reply.get("success"), Some(&json!(true)));
        let result = reply.get("result").unwrap();
        assert_eq!(result["drawn_cards"].as_array().unwrap().len(), 3);
        assert!(reply.get_str("reading").is_some());

        let state = runtime.sessions().get("s1").await.unwrap();
        assert!(state.intake.is_none());
        assert_eq!(state.last_reading.unwrap().system, "tarot");

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bazi_conversation_with_bad_date() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = say(&runtime, "s1", "我想看八字").await;
        assert_eq!(reply.get_str("system"), Some("bazi"));
        assert_eq!(reply.get_str("next_field"), Some("birth_date"));

        let reply = say(&runtime, "s1", "1990/1/15").await;
        assert_eq!(reply.get("error"), Some(&json!(true)));
        assert_eq!(reply.get_str("next_field"), Some("birth_date"));

        say(&runtime, "s1", "1990-01-15").await;
        say(&runtime, "s1", "14:30").await;
        let reply = say(&runtime, "s1", "男").await;
        assert_eq!(reply.kind(), kinds::FORTUNE_RESPONSE);
        assert_eq!(reply.get("result").unwrap()["four_pillars"]["year"], json!("庚午"));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_returns_to_menu() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        say(&runtime, "s1", "3").await;
        let reply = say(&runtime, "s1", "取消").await;
        assert_eq!(reply.kind(), kinds::SYSTEM_MENU);
        assert!(runtime.sessions().get("s1").await.unwrap().intake.is_none());

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_free_text_goes_to_chat() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = say(&runtime, "s1", "你好").await;
        assert_eq!(reply.kind(), kinds::CHAT_RESPONSE);
        assert_eq!(reply.recipient(), "client");
        assert!(reply.get_str("response").is_some());

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_fortune_request() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = runtime
            .request(
                Message::new(kinds::FORTUNE_REQUEST, "client", "master_agent")
                    .with_value("system_type", "zodiac")
                    .with_value("birth_date", "1992-11-30"),
            )
            .await;
        assert_eq!(reply.kind(), kinds::FORTUNE_RESPONSE);
        assert_eq!(reply.get("result").unwrap()["zodiac_sign"]["english"], json!("Sagittarius"));
        assert!(reply.session_id().is_some());

        let reply = runtime
            .request(
                Message::new(kinds::FORTUNE_REQUEST, "client", "master_agent")
                    .with_value("system_type", "palmistry"),
            )
            .await;
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);

        let reply = runtime
            .request(
                Message::new(kinds::FORTUNE_REQUEST, "client", "master_agent")
                    .with_value("system_type", "bazi"),
            )
            .await;
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);
        assert_eq!(reply.get("success"), Some(&json!(false)));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_registration() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let reply = runtime
            .request(
                Message::new(kinds::AGENT_REGISTRATION, "ziwei_agent", "master_agent")
                    .with_value("agent_name", "ziwei_agent")
                    .with_value("agent_type", "ziwei"),
            )
            .await;
        assert_eq!(reply.kind(), kinds::REGISTRATION_SUCCESS);
        assert_eq!(reply.get_str("status"), Some("registered"));

        let reply = runtime
            .request(Message::new(kinds::AGENT_REGISTRATION, "x", "master_agent"))
            .await;
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);

        runtime.stop().await.unwrap();
    }
}
