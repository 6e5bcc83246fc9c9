//! Agents that run one divination system end to end

use super::i18n::normalize_language;
use crate::agent::context::AgentContext;
use crate::agent::handler::HandlerTable;
use crate::agent::specialist::Specialist;
use crate::config::AgentConfig;
use crate::divination::{Calculator, FortuneSystem, field_str, tarot};
use crate::error::{AgentError, AgentResult};
use crate::messages::{Message, Payload, kinds};
use crate::session::SessionUpdate;
use crate::tools::LlmTool;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_LLM_TOOL: &str = "llm_tool";
const DEFAULT_CACHE_TTL: u64 = 3600;

/// Validates the request, runs the calculator and asks the LLM to turn the
/// result into a reading. Calculator output is memoised in the session
/// store cache so repeated questions skip the computation.
pub struct DivinationSpecialist {
    system: FortuneSystem,
    calculator: Box<dyn Calculator>,
    llm_tool: String,
    cache_ttl: Duration,
}

impl DivinationSpecialist {
    pub fn new(system: FortuneSystem) -> Self {
        Self {
            system,
            calculator: system.calculator(),
            llm_tool: DEFAULT_LLM_TOOL.to_string(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL),
        }
    }

    /// Options: `llm_tool`, `cache_ttl` (seconds)
    pub fn from_config(system: FortuneSystem, config: &AgentConfig) -> Self {
        let mut specialist = Self::new(system);
        if let Some(tool) = config.option_str("llm_tool") {
            specialist.llm_tool = tool.to_string();
        }
        if let Some(ttl) = config.options.get("cache_ttl").and_then(Value::as_u64) {
            specialist.cache_ttl = Duration::from_secs(ttl);
        }
        specialist
    }

    pub fn system(&self) -> FortuneSystem {
        self.system
    }

    async fn reading(&self, ctx: &AgentContext, message: &Message) -> AgentResult<Payload> {
        let input = self.validate(ctx, message).await?;
        let output = self.process(ctx, message, input).await?;
        self.generate(ctx, message, output).await
    }

    fn cache_key(&self, input: &Payload) -> AgentResult<String> {
        let canonical: BTreeMap<&String, &Value> = input.iter().collect();
        let encoded = serde_json::to_string(&canonical)?;
        Ok(format!("{}:{:016x}", self.system, tarot::seed_from(&encoded)))
    }

    fn system_prompt(&self, language: &str) -> String {
        let english = language == "en";
        match (self.system, english) {
            (FortuneSystem::Bazi, false) => {
                "你是一位精通中国传统八字命理的大师。请根据四柱、五行和日主，给出温和、具体、积极的解读。".into()
            }
            (FortuneSystem::Bazi, true) => {
                "You are a master of Chinese BaZi astrology. Interpret the four pillars, five elements and day master with warmth and concrete advice.".into()
            }
            (FortuneSystem::Tarot, false) => {
                "你是一位经验丰富的塔罗牌解读师。请结合牌阵位置和正逆位，回答用户的问题。".into()
            }
            (FortuneSystem::Tarot, true) => {
                "You are an experienced tarot reader. Answer the querent's question using each card's position and orientation.".into()
            }
            (FortuneSystem::Zodiac, false) => {
                "你是一位西方占星师。请根据星座、元素和守护星，分析性格特点并给出建议。".into()
            }
            (FortuneSystem::Zodiac, true) => {
                "You are a Western astrologer. Describe personality traits and give advice based on the sign, element and ruling planet.".into()
            }
        }
    }

    fn user_prompt(&self, output: &Payload, language: &str) -> String {
        let canonical: BTreeMap<&String, &Value> = output.iter().collect();
        let data = serde_json::to_string_pretty(&canonical).unwrap_or_default();
        if language == "en" {
            format!("Here is the {} calculation:\n{}\n\nPlease give a reading.", self.system, data)
        } else {
            format!("以下是{}的计算结果：\n{}\n\n请给出解读。", self.system, data)
        }
    }

    /// Reading built from the calculation alone, used when the LLM fails
    fn template_reading(&self, output: &Payload, language: &str) -> String {
        let english = language == "en";
        let str_at = |value: &Value, key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match self.system {
            FortuneSystem::Bazi => {
                let pillars = output.get("four_pillars").cloned().unwrap_or(Value::Null);
                let analysis = output.get("element_analysis").cloned().unwrap_or(Value::Null);
                let day_master = output
                    .get("day_master")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let chart = ["year", "month", "day", "hour"]
                    .iter()
                    .map(|k| str_at(&pillars, k))
                    .collect::<Vec<_>>()
                    .join(" ");
                if english {
                    format!(
                        "Your chart is {}. Day master {}; {} is strongest and {} weakest.",
                        chart,
                        day_master,
                        str_at(&analysis, "strongest"),
                        str_at(&analysis, "weakest")
                    )
                } else {
                    format!(
                        "您的八字为 {}，日主为{}。五行中{}最旺，{}偏弱，宜扬长补短、顺势而为。",
                        chart,
                        day_master,
                        str_at(&analysis, "strongest"),
                        str_at(&analysis, "weakest")
                    )
                }
            }
            FortuneSystem::Tarot => {
                let cards = output
                    .get("drawn_cards")
                    .and_then(Value::as_array)
                    .map(|cards| {
                        cards
                            .iter()
                            .map(|card| {
                                let reversed = card.get("reversed").and_then(Value::as_bool).unwrap_or(false);
                                let (name, orientation) = match (english, reversed) {
                                    (true, true) => (str_at(card, "english"), "reversed"),
                                    (true, false) => (str_at(card, "english"), "upright"),
                                    (false, true) => (str_at(card, "name"), "逆位"),
                                    (false, false) => (str_at(card, "name"), "正位"),
                                };
                                format!("{}: {} ({})", str_at(card, "position"), name, orientation)
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                if english {
                    format!("The cards drawn for your question:\n{}", cards)
                } else {
                    format!("为您的问题抽到的牌：\n{}", cards)
                }
            }
            FortuneSystem::Zodiac => {
                let sign = output.get("zodiac_sign").cloned().unwrap_or(Value::Null);
                if english {
                    format!(
                        "You are {}, a {} sign ruled by {}.",
                        str_at(&sign, "english"),
                        str_at(&sign, "element_en"),
                        str_at(&sign, "ruler")
                    )
                } else {
                    format!(
                        "您是{}，属{}象星座，守护星为{}。",
                        str_at(&sign, "name"),
                        str_at(&sign, "element"),
                        str_at(&sign, "ruler")
                    )
                }
            }
        }
    }
}

#[async_trait]
impl Specialist for DivinationSpecialist {
    fn description(&self) -> &str {
        match self.system {
            FortuneSystem::Bazi => "BaZi four pillars reading",
            FortuneSystem::Tarot => "Tarot card reading",
            FortuneSystem::Zodiac => "Western zodiac reading",
        }
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.llm_tool.clone()]
    }

    fn register_handlers(self: Arc<Self>, table: &mut HandlerTable) {
        let this = Arc::clone(&self);
        table.register(kinds::FORTUNE_REQUEST, move |ctx: AgentContext, msg: Message| {
            let this = Arc::clone(&this);
            async move {
                let payload = this.reading(&ctx, &msg).await?;
                Ok(msg.reply(kinds::FORTUNE_RESPONSE).with_payload(payload))
            }
        });
    }

    async fn validate(&self, _ctx: &AgentContext, message: &Message) -> AgentResult<Payload> {
        let mut input = message.payload().clone();
        input.remove("system_type");

        let missing: Vec<&str> = self
            .calculator
            .required_fields()
            .iter()
            .copied()
            .filter(|field| field_str(&input, field).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        input
            .entry("language".to_string())
            .or_insert_with(|| json!(normalize_language(message.language())));

        if self.system == FortuneSystem::Tarot
            && !input.contains_key("seed")
            && let Some(session) = message.session_id()
        {
            let question = field_str(&input, "question").unwrap_or_default();
            input.insert(
                "seed".into(),
                json!(tarot::seed_from(&format!("{}|{}", session, question))),
            );
        }
        Ok(input)
    }

    async fn process(
        &self,
        ctx: &AgentContext,
        _message: &Message,
        input: Payload,
    ) -> AgentResult<Payload> {
        let key = self.cache_key(&input)?;
        if let Some(Value::Object(cached)) = ctx.sessions().cache_get(&key).await {
            debug!("{}: calculation cache hit {}", ctx.agent_name(), key);
            return Ok(cached.into_iter().collect());
        }

        let mut output = self.calculator.calculate(&input)?;
        if let Some(language) = input.get("language") {
            output.insert("language".into(), language.clone());
        }

        let encoded: serde_json::Map<String, Value> =
            output.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ctx.sessions()
            .cache_set(key, Value::Object(encoded), Some(self.cache_ttl))
            .await;
        Ok(output)
    }

    async fn generate(
        &self,
        ctx: &AgentContext,
        message: &Message,
        output: Payload,
    ) -> AgentResult<Payload> {
        let language = output
            .get("language")
            .and_then(Value::as_str)
            .map(normalize_language)
            .unwrap_or_else(|| normalize_language(message.language()));

        let llm = ctx.tool_as::<LlmTool>(&self.llm_tool)?;
        let (reading, llm_used) = match llm
            .generate_response(&self.system_prompt(language), &self.user_prompt(&output, language))
            .await
        {
            Ok(generation) => (generation.text, true),
            Err(e) => {
                warn!("{}: LLM unavailable, using template reading: {}", ctx.agent_name(), e);
                (self.template_reading(&output, language), false)
            }
        };

        let result: serde_json::Map<String, Value> = output.into_iter().collect();
        let mut payload = Payload::new();
        payload.insert("system".into(), json!(self.system));
        payload.insert("reading".into(), json!(reading));
        payload.insert("result".into(), Value::Object(result.clone()));
        payload.insert("llm_used".into(), json!(llm_used));
        payload.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));

        if let Some(session) = message.session_id() {
            let record = json!({"result": result, "reading": reading});
            let update = SessionUpdate::new().record_reading(self.system.as_str(), record);
            if !ctx.sessions().update(session, update).await {
                debug!("{}: reading not recorded, no session {}", ctx.agent_name(), session);
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SessionsConfig, ToolConfig};
    use crate::error::ErrorKind;
    use crate::runtime::{ComponentRegistry, Runtime};
    use crate::tools::{LlmError, MockConnector, Tool};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.sessions = SessionsConfig::in_dir(dir.path());
        config
    }

    async fn runtime_with(config: Config) -> Runtime {
        let runtime = Runtime::new(config);
        runtime.initialize().await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn test_zodiac_reading_records_session() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with(test_config(&dir)).await;
        let session = runtime.sessions().create(None, "zh").await;

        let request = Message::new(kinds::FORTUNE_REQUEST, "client", "zodiac_agent")
            .with_session(&session)
            .with_value("birth_date", "1990-08-01");
        let reply = runtime.request(request).await;

        assert_eq!(reply.kind(), kinds::FORTUNE_RESPONSE);
        assert_eq!(reply.get_str("system"), Some("zodiac"));
        assert_eq!(reply.get("result").unwrap()["zodiac_sign"]["english"], json!("Leo"));
        assert_eq!(reply.get("llm_used"), Some(&json!(true)));

        let state = runtime.sessions().get(&session).await.unwrap();
        assert_eq!(state.current_system.as_deref(), Some("zodiac"));
        assert_eq!(state.fortune_history.len(), 1);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_fields_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with(test_config(&dir)).await;

        let reply = runtime
            .request(Message::new(kinds::FORTUNE_REQUEST, "client", "bazi_agent"))
            .await;
        assert_eq!(reply.kind(), kinds::VALIDATION_ERROR_RESPONSE);
        assert_eq!(reply.get_str("error_type"), Some(ErrorKind::Validation.as_str()));
        assert!(reply.get_str("error").unwrap().contains("birth_date"));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tarot_draw_is_stable_per_session_and_question() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with(test_config(&dir)).await;

        let ask = |session: &str| {
            Message::new(kinds::FORTUNE_REQUEST, "client", "tarot_agent")
                .with_session(session)
                .with_value("question", "事业如何？")
                .with_value("spread_type", "three_card")
        };
        let first = runtime.request(ask("s1")).await;
        let again = runtime.request(ask("s1")).await;
        assert_eq!(first.get("result"), again.get("result"));
        assert_eq!(
            first.get("result").unwrap()["drawn_cards"].as_array().unwrap().len(),
            3
        );

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_template() {
        let dir = TempDir::new().unwrap();
        let mut registry = ComponentRegistry::with_builtins();
        registry.register_tool("llm", |config: &ToolConfig| {
            let connector = MockConnector::failing(LlmError::Connection("refused".into()));
            Ok(Arc::new(LlmTool::new(&config.name, Arc::new(connector), Duration::from_secs(1)))
                as Arc<dyn Tool>)
        });
        let runtime = Runtime::with_registry(test_config(&dir), registry);
        runtime.initialize().await.unwrap();

        let reply = runtime
            .request(
                Message::new("zodiac_request", "client", "zodiac_agent")
                    .with_language("en")
                    .with_value("birth_date", "1990-01-10"),
            )
            .await;
        assert_eq!(reply.kind(), "zodiac_request_response");
        assert_eq!(reply.get("llm_used"), Some(&json!(false)));
        assert!(reply.get_str("reading").unwrap().contains("Capricorn"));

        runtime.stop().await.unwrap();
    }
}
