//! Western sun signs

use super::{CalcError, Calculator, FortuneSystem, parse_date, require_str};
use crate::messages::Payload;
use chrono::Datelike;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sign {
    pub name: &'static str,
    pub english: &'static str,
    pub element: &'static str,
    pub element_en: &'static str,
    pub quality: &'static str,
    pub ruler: &'static str,
    /// Inclusive `(month, day)` bounds
    pub start: (u32, u32),
    pub end: (u32, u32),
}

impl Sign {
    /// Whether `(month, day)` falls inside this sign, across the year end too
    pub fn contains(&self, month: u32, day: u32) -> bool {
        let date = (month, day);
        if self.start <= self.end {
            self.start <= date && date <= self.end
        } else {
            date >= self.start || date <= self.end
        }
    }

    pub fn date_range(&self) -> String {
        format!(
            "{}/{} - {}/{}",
            self.start.0, self.start.1, self.end.0, self.end.1
        )
    }
}

const fn sign(
    name: &'static str,
    english: &'static str,
    element: &'static str,
    element_en: &'static str,
    quality: &'static str,
    ruler: &'static str,
    start: (u32, u32),
    end: (u32, u32),
) -> Sign {
    Sign {
        name,
        english,
        element,
        element_en,
        quality,
        ruler,
        start,
        end,
    }
}

pub static SIGNS: [Sign; 12] = [
    sign("白羊座", "Aries", "火", "Fire", "主动", "火星", (3, 21), (4, 19)),
    sign("金牛座", "Taurus", "土", "Earth", "固定", "金星", (4, 20), (5, 20)),
    sign("双子座", "Gemini", "风", "Air", "变动", "水星", (5, 21), (6, 20)),
    sign("巨蟹座", "Cancer", "水", "Water", "主动", "月亮", (6, 21), (7, 22)),
    sign("狮子座", "Leo", "火", "Fire", "固定", "太阳", (7, 23), (8, 22)),
    sign("处女座", "Virgo", "土", "Earth", "变动", "水星", (8, 23), (9, 22)),
    sign("天秤座", "Libra", "风", "Air", "主动", "金星", (9, 23), (10, 22)),
    sign("天蝎座", "Scorpio", "水", "Water", "固定", "冥王星", (10, 23), (11, 21)),
    sign("射手座", "Sagittarius", "火", "Fire", "变动", "木星", (11, 22), (12, 21)),
    sign("摩羯座", "Capricorn", "土", "Earth", "主动", "土星", (12, 22), (1, 19)),
    sign("水瓶座", "Aquarius", "风", "Air", "固定", "天王星", (1, 20), (2, 18)),
    sign("双鱼座", "Pisces", "水", "Water", "变动", "海王星", (2, 19), (3, 20)),
];

/// Elements that sit well with `element`
pub fn compatible_elements(element: &str) -> &'static [&'static str] {
    match element {
        "火" => &["火", "风"],
        "土" => &["土", "水"],
        "风" => &["风", "火"],
        "水" => &["水", "土"],
        _ => &[],
    }
}

pub fn sign_for(month: u32, day: u32) -> Option<&'static Sign> {
    SIGNS.iter().find(|sign| sign.contains(month, day))
}

/// Calculator for the zodiac system
#[derive(Debug, Clone, Copy, Default)]
pub struct ZodiacCalculator;

impl ZodiacCalculator {
    pub fn new() -> Self {
        Self
    }
}

impl Calculator for ZodiacCalculator {
    fn system(&self) -> FortuneSystem {
        FortuneSystem::Zodiac
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["birth_date"]
    }

    fn calculate(&self, input: &Payload) -> Result<Payload, CalcError> {
        let date = parse_date("birth_date", require_str(input, "birth_date")?)?;
        let sign = sign_for(date.month(), date.day())
            .ok_or_else(|| CalcError::invalid("birth_date", "no sign covers this date"))?;

        let mut output = Payload::new();
        output.insert(
            "birth_info".into(),
            json!({"year": date.year(), "month": date.month(), "day": date.day()}),
        );
        output.insert("zodiac_sign".into(), json!(sign));
        output.insert(
            "element_compatibility".into(),
            json!(compatible_elements(sign.element)),
        );
        output.insert("date_range".into(), json!(sign.date_range()));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_day_has_exactly_one_sign() {
        let days_in_month = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        for (m, &days) in days_in_month.iter().enumerate() {
            for d in 1..=days {
                let month = m as u32 + 1;
                let matches = SIGNS.iter().filter(|s| s.contains(month, d)).count();
                assert_eq!(matches, 1, "{}/{}", month, d);
            }
        }
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(sign_for(1, 19).unwrap().english, "Capricorn");
        assert_eq!(sign_for(1, 20).unwrap().english, "Aquarius");
        assert_eq!(sign_for(12, 31).unwrap().english, "Capricorn");
        assert_eq!(sign_for(3, 21).unwrap().english, "Aries");
        assert_eq!(sign_for(2, 29).unwrap().english, "Pisces");
    }

    #[test]
    fn test_calculate_payload() {
        let mut input = Payload::new();
        input.insert("birth_date".into(), json!("1990-08-01"));

        let output = ZodiacCalculator::new().calculate(&input).unwrap();
        assert_eq!(output["zodiac_sign"]["english"], json!("Leo"));
        assert_eq!(output["zodiac_sign"]["element"], json!("火"));
        assert_eq!(output["element_compatibility"], json!(["火", "风"]));
        assert_eq!(output["date_range"], json!("7/23 - 8/22"));
    }

    #[test]
    fn test_birth_date_required() {
        assert!(ZodiacCalculator::new().calculate(&Payload::new()).is_err());
    }
}
