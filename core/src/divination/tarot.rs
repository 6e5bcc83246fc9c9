//! Tarot deck, spreads and a seeded draw

use super::{CalcError, Calculator, FortuneSystem, field_str, require_str};
use crate::messages::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const MAJOR_ARCANA: [(&str, &str); 22] = [
    ("愚者", "The Fool"),
    ("魔术师", "The Magician"),
    ("女祭司", "The High Priestess"),
    ("皇后", "The Empress"),
    ("皇帝", "The Emperor"),
    ("教皇", "The Hierophant"),
    ("恋人", "The Lovers"),
    ("战车", "The Chariot"),
    ("力量", "Strength"),
    ("隐者", "The Hermit"),
    ("命运之轮", "Wheel of Fortune"),
    ("正义", "Justice"),
    ("倒吊人", "The Hanged Man"),
    ("死神", "Death"),
    ("节制", "Temperance"),
    ("恶魔", "The Devil"),
    ("塔", "The Tower"),
    ("星星", "The Star"),
    ("月亮", "The Moon"),
    ("太阳", "The Sun"),
    ("审判", "Judgement"),
    ("世界", "The World"),
];

const SUITS: [(&str, &str); 4] = [
    ("权杖", "Wands"),
    ("圣杯", "Cups"),
    ("宝剑", "Swords"),
    ("金币", "Pentacles"),
];

const RANKS: [(&str, &str); 14] = [
    ("王牌", "Ace"),
    ("二", "Two"),
    ("三", "Three"),
    ("四", "Four"),
    ("五", "Five"),
    ("六", "Six"),
    ("七", "Seven"),
    ("八", "Eight"),
    ("九", "Nine"),
    ("十", "Ten"),
    ("侍从", "Page"),
    ("骑士", "Knight"),
    ("王后", "Queen"),
    ("国王", "King"),
];

pub const DECK_SIZE: usize = 78;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: usize,
    pub name: String,
    pub english: String,
    pub suit: String,
}

/// The full 78-card deck, major arcana first
pub fn deck() -> Vec<Card> {
    let mut cards: Vec<Card> = MAJOR_ARCANA
        .iter()
        .enumerate()
        .map(|(id, (name, english))| Card {
            id,
            name: name.to_string(),
            english: english.to_string(),
            suit: "Major Arcana".to_string(),
        })
        .collect();

    for (suit_zh, suit_en) in SUITS {
        for (rank_zh, rank_en) in RANKS {
            cards.push(Card {
                id: cards.len(),
                name: format!("{}{}", suit_zh, rank_zh),
                english: format!("{} of {}", rank_en, suit_en),
                suit: suit_en.to_string(),
            });
        }
    }
    cards
}

/// Card layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spread {
    Single,
    ThreeCard,
    CelticCross,
    Relationship,
}

impl Spread {
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim() {
            "single" => Some(Spread::Single),
            "three_card" => Some(Spread::ThreeCard),
            "celtic_cross" => Some(Spread::CelticCross),
            "relationship" => Some(Spread::Relationship),
            _ => None,
        }
    }

    /// Spread picked from the numbered menu (1-4)
    pub fn from_menu_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(Spread::Single),
            "2" => Some(Spread::ThreeCard),
            "3" => Some(Spread::CelticCross),
            "4" => Some(Spread::Relationship),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Spread::Single => "single",
            Spread::ThreeCard => "three_card",
            Spread::CelticCross => "celtic_cross",
            Spread::Relationship => "relationship",
        }
    }

    pub fn name(&self, language: &str) -> &'static str {
        match (self, language) {
            (Spread::Single, "en") => "Single Card",
            (Spread::ThreeCard, "en") => "Three Card Spread",
            (Spread::CelticCross, "en") => "Celtic Cross",
            (Spread::Relationship, "en") => "Relationship Spread",
            (Spread::Single, _) => "单牌阅读",
            (Spread::ThreeCard, _) => "三牌阵",
            (Spread::CelticCross, _) => "凯尔特十字",
            (Spread::Relationship, _) => "关系阵",
        }
    }

    pub fn positions(&self, language: &str) -> &'static [&'static str] {
        let en = language == "en";
        match self {
            Spread::Single if en => &["Current Situation"],
            Spread::Single => &["当前状况"],
            Spread::ThreeCard if en => &["Past", "Present", "Future"],
            Spread::ThreeCard => &["过去", "现在", "未来"],
            Spread::CelticCross if en => &[
                "Present",
                "Challenge",
                "Distant Past",
                "Recent Past",
                "Possible Outcome",
                "Near Future",
                "Your Approach",
                "External Influences",
                "Hopes and Fears",
                "Final Outcome",
            ],
            Spread::CelticCross => &[
                "当前状况",
                "挑战",
                "远程过去",
                "近期过去",
                "可能结果",
                "近期未来",
                "你的方法",
                "外部影响",
                "希望与恐惧",
                "最终结果",
            ],
            Spread::Relationship if en => &["You", "The Other", "The Relationship", "Advice"],
            Spread::Relationship => &["你", "对方", "关系", "建议"],
        }
    }

    pub fn card_count(&self) -> usize {
        self.positions("zh").len()
    }
}

/// splitmix64; small, seedable and stable across platforms
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

/// FNV-1a over `text`, used to derive a draw seed
pub fn seed_from(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// A drawn card and its orientation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawnCard {
    #[serde(flatten)]
    pub card: Card,
    pub reversed: bool,
}

/// Fisher-Yates shuffle of the deck, then the top `count` cards
pub fn draw(count: usize, seed: u64, allow_reversed: bool) -> Vec<DrawnCard> {
    let mut rng = SplitMix64(seed);
    let mut cards = deck();
    for i in (1..cards.len()).rev() {
        let j = rng.below(i + 1);
        cards.swap(i, j);
    }

    cards
        .into_iter()
        .take(count.clamp(1, DECK_SIZE))
        .map(|card| DrawnCard {
            card,
            reversed: allow_reversed && rng.next() & 1 == 1,
        })
        .collect()
}

/// Calculator for the tarot system.
///
/// The draw is seeded from the `seed` field when given, otherwise from the
/// question and spread, so the same request yields the same cards.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarotCalculator;

impl Calculator for TarotCalculator {
    fn system(&self) -> FortuneSystem {
        FortuneSystem::Tarot
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["question"]
    }

    fn calculate(&self, input: &Payload) -> Result<Payload, CalcError> {
        let question = require_str(input, "question")?;
        let spread = field_str(input, "spread_type")
            .and_then(Spread::parse)
            .unwrap_or(Spread::Single);
        let language = field_str(input, "language").unwrap_or("zh");
        let allow_reversed = input
            .get("allow_reversed")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let seed = match input.get("seed") {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| CalcError::invalid("seed", "must be an unsigned integer"))?,
            None => seed_from(&format!("{}|{}", question, spread.key())),
        };

        let positions = spread.positions(language);
        let cards = draw(spread.card_count(), seed, allow_reversed);
        let drawn: Vec<Value> = cards
            .iter()
            .zip(positions)
            .map(|(drawn, position)| {
                json!({
                    "position": position,
                    "id": drawn.card.id,
                    "name": drawn.card.name,
                    "english": drawn.card.english,
                    "suit": drawn.card.suit,
                    "reversed": drawn.reversed,
                })
            })
            .collect();

        let mut output = Payload::new();
        output.insert("question".into(), json!(question));
        output.insert(
            "spread".into(),
            json!({
                "type": spread.key(),
                "name": spread.name(language),
                "positions": positions,
                "card_count": spread.card_count(),
            }),
        );
        output.insert("drawn_cards".into(), Value::Array(drawn));
        output.insert("seed".into(), json!(seed));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_deck_is_complete() {
        let cards = deck();
        assert_eq!(cards.len(), DECK_SIZE);
        assert_eq!(cards[0].english, "The Fool");
        assert_eq!(cards[22].english, "Ace of Wands");
        assert_eq!(cards[77].english, "King of Pentacles");
        assert!(cards.iter().enumerate().all(|(i, c)| c.id == i));
    }

    #[test]
    fn test_draw_is_deterministic_and_distinct() {
        let a = draw(10, 42, true);
        let b = draw(10, 42, true);
        assert_eq!(a, b);

        let ids: HashSet<usize> = a.iter().map(|c| c.card.id).collect();
        assert_eq!(ids.len(), 10);

        assert_ne!(draw(10, 43, true), a);
        assert!(draw(5, 7, false).iter().all(|c| !c.reversed));
    }

    #[test]
    fn test_spreads() {
        assert_eq!(Spread::Single.card_count(), 1);
        assert_eq!(Spread::ThreeCard.card_count(), 3);
        assert_eq!(Spread::CelticCross.card_count(), 10);
        assert_eq!(Spread::Relationship.card_count(), 4);
        assert_eq!(Spread::from_menu_choice("3"), Some(Spread::CelticCross));
        assert_eq!(Spread::parse("pyramid"), None);
        for spread in [Spread::Single, Spread::ThreeCard, Spread::CelticCross, Spread::Relationship] {
            assert_eq!(spread.positions("en").len(), spread.card_count());
        }
    }

    #[test]
    fn test_calculate_three_card() {
        let mut input = Payload::new();
        input.insert("question".into(), json!("我的事业发展如何？"));
        input.insert("spread_type".into(), json!("three_card"));

        let first = TarotCalculator.calculate(&input).unwrap();
        let second = TarotCalculator.calculate(&input).unwrap();
        assert_eq!(first, second);

        let cards = first["drawn_cards"].as_array().unwrap();
        assert_eq!(cards.len(), 3);
        assert_eq!(cards[0]["position"], json!("过去"));
        assert_eq!(first["spread"]["name"], json!("三牌阵"));
    }

    #[test]
    fn test_unknown_spread_falls_back_to_single() {
        let mut input = Payload::new();
        input.insert("question".into(), json!("love?"));
        input.insert("spread_type".into(), json!("pyramid"));
        input.insert("seed".into(), json!(9));

        let output = TarotCalculator.calculate(&input).unwrap();
        assert_eq!(output["drawn_cards"].as_array().unwrap().len(), 1);
        assert_eq!(output["seed"], json!(9));
    }

    #[test]
    fn test_question_required() {
        assert_eq!(
            TarotCalculator.calculate(&Payload::new()).unwrap_err(),
            CalcError::MissingField("question".into())
        );
    }
}
