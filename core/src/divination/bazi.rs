//! Four Pillars (八字) from a birth date and hour

use super::{CalcError, Calculator, FortuneSystem, field_str, parse_date, parse_time, require_str};
use crate::messages::Payload;
use chrono::{Datelike, NaiveDate, Timelike};
use serde_json::{Value, json};

pub const HEAVENLY_STEMS: [&str; 10] = ["甲", "乙", "丙", "丁", "戊", "己", "庚", "辛", "壬", "癸"];
pub const EARTHLY_BRANCHES: [&str; 12] =
    ["子", "丑", "寅", "卯", "辰", "巳", "午", "未", "申", "酉", "戌", "亥"];

/// Five elements in generating order
pub const ELEMENTS: [&str; 5] = ["木", "火", "土", "金", "水"];

/// 1984 is a 甲子 year
const BASE_YEAR: i32 = 1984;

/// 2000-01-01 is 戊午, index 54 of the sexagenary cycle
const DAY_ANCHOR: (i32, u32, u32) = (2000, 1, 1);
const DAY_ANCHOR_INDEX: i64 = 54;

/// Hour used when no birth time is given
const DEFAULT_HOUR: u32 = 12;

/// Element of each stem, by index
const STEM_ELEMENTS: [usize; 10] = [0, 0, 1, 1, 2, 2, 3, 3, 4, 4];
/// Element of each branch, by index
const BRANCH_ELEMENTS: [usize; 12] = [4, 2, 0, 0, 2, 1, 1, 2, 3, 3, 2, 4];

/// Stem and branch indices of one pillar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pillar {
    pub stem: usize,
    pub branch: usize,
}

impl Pillar {
    fn from_cycle(index: i64) -> Self {
        let index = index.rem_euclid(60) as usize;
        Self {
            stem: index % 10,
            branch: index % 12,
        }
    }

    pub fn stem_char(&self) -> &'static str {
        HEAVENLY_STEMS[self.stem]
    }

    pub fn branch_char(&self) -> &'static str {
        EARTHLY_BRANCHES[self.branch]
    }

    pub fn name(&self) -> String {
        format!("{}{}", self.stem_char(), self.branch_char())
    }

    /// Yang for even stem and branch indices
    fn yang_count(&self) -> usize {
        usize::from(self.stem % 2 == 0) + usize::from(self.branch % 2 == 0)
    }
}

pub fn year_pillar(year: i32) -> Pillar {
    Pillar::from_cycle(i64::from(year - BASE_YEAR))
}

/// Month pillar. The first month is 寅 and the stem follows the year stem
/// (甲己之年丙作首).
pub fn month_pillar(year: i32, month: u32) -> Pillar {
    let start = (year_pillar(year).stem % 5) * 2 + 2;
    let offset = month.saturating_sub(1) as usize;
    Pillar {
        stem: (start + offset) % 10,
        branch: (2 + offset) % 12,
    }
}

pub fn day_pillar(date: NaiveDate) -> Pillar {
    let anchor = NaiveDate::from_ymd_opt(DAY_ANCHOR.0, DAY_ANCHOR.1, DAY_ANCHOR.2)
        .map_or(730_120, |d| d.num_days_from_ce());
    let days = i64::from(date.num_days_from_ce() - anchor);
    Pillar::from_cycle(days + DAY_ANCHOR_INDEX)
}

/// Hour pillar; 23:00 already belongs to the next 子 hour
pub fn hour_pillar(hour: u32, day_stem: usize) -> Pillar {
    let branch = ((hour as usize + 1) / 2) % 12;
    let start = (day_stem % 5) * 2;
    Pillar {
        stem: (start + branch) % 10,
        branch,
    }
}

/// Complete chart for one birth moment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub year: Pillar,
    pub month: Pillar,
    pub day: Pillar,
    pub hour: Pillar,
}

impl Chart {
    pub fn new(date: NaiveDate, hour: u32) -> Self {
        let day = day_pillar(date);
        Self {
            year: year_pillar(date.year()),
            month: month_pillar(date.year(), date.month()),
            day,
            hour: hour_pillar(hour, day.stem),
        }
    }

    fn pillars(&self) -> [Pillar; 4] {
        [self.year, self.month, self.day, self.hour]
    }

    /// Count of each element over all eight characters, in [`ELEMENTS`] order
    pub fn element_counts(&self) -> [usize; 5] {
        let mut counts = [0; 5];
        for pillar in self.pillars() {
            counts[STEM_ELEMENTS[pillar.stem]] += 1;
            counts[BRANCH_ELEMENTS[pillar.branch]] += 1;
        }
        counts
    }

    pub fn yang_count(&self) -> usize {
        self.pillars().iter().map(Pillar::yang_count).sum()
    }

    pub fn day_master(&self) -> &'static str {
        self.day.stem_char()
    }
}

/// Calculator for the 八字 system
#[derive(Debug, Clone, Copy, Default)]
pub struct BaziCalculator;

impl Calculator for BaziCalculator {
    fn system(&self) -> FortuneSystem {
        FortuneSystem::Bazi
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["birth_date", "birth_time"]
    }

    fn calculate(&self, input: &Payload) -> Result<Payload, CalcError> {
        let date = parse_date("birth_date", require_str(input, "birth_date")?)?;
        let hour = match field_str(input, "birth_time") {
            Some(text) => parse_time("birth_time", text)?.hour(),
            None => DEFAULT_HOUR,
        };

        let chart = Chart::new(date, hour);
        let counts = chart.element_counts();

        let mut five_elements = serde_json::Map::new();
        for (element, count) in ELEMENTS.iter().zip(counts) {
            five_elements.insert(element.to_string(), json!(count));
        }

        // First maximum and first minimum in element order
        let strongest = (0..5).fold(0, |best, i| if counts[i] > counts[best] { i } else { best });
        let weakest = (0..5).fold(0, |best, i| if counts[i] < counts[best] { i } else { best });
        let missing: Vec<&str> = (0..5).filter(|&i| counts[i] == 0).map(|i| ELEMENTS[i]).collect();

        let yang = chart.yang_count();
        let detailed = |pillar: Pillar| json!({"stem": pillar.stem_char(), "branch": pillar.branch_char()});

        let mut output = Payload::new();
        output.insert(
            "birth_info".into(),
            json!({
                "year": date.year(),
                "month": date.month(),
                "day": date.day(),
                "hour": hour,
            }),
        );
        output.insert(
            "four_pillars".into(),
            json!({
                "year": chart.year.name(),
                "month": chart.month.name(),
                "day": chart.day.name(),
                "hour": chart.hour.name(),
            }),
        );
        output.insert(
            "detailed_pillars".into(),
            json!({
                "year": detailed(chart.year),
                "month": detailed(chart.month),
                "day": detailed(chart.day),
                "hour": detailed(chart.hour),
            }),
        );
        output.insert("day_master".into(), json!(chart.day_master()));
        output.insert("five_elements".into(), Value::Object(five_elements));
        output.insert("yin_yang".into(), json!({"阳": yang, "阴": 8 - yang}));
        output.insert(
            "element_analysis".into(),
            json!({
                "strongest": ELEMENTS[strongest],
                "weakest": ELEMENTS[weakest],
                "missing": missing,
            }),
        );
        if let Some(gender) = field_str(input, "gender") {
            output.insert("gender".into(), json!(gender));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_year_pillar() {
        assert_eq!(year_pillar(1984).name(), "甲子");
        assert_eq!(year_pillar(1990).name(), "庚午");
        assert_eq!(year_pillar(2024).name(), "甲辰");
        assert_eq!(year_pillar(1983).name(), "癸亥");
    }

    #[test]
    fn test_month_pillar_follows_year_stem() {
        // 甲 year starts at 丙寅
        assert_eq!(month_pillar(1984, 1).name(), "丙寅");
        assert_eq!(month_pillar(1984, 12).name(), "丁丑");
        // 乙 year starts at 戊寅
        assert_eq!(month_pillar(1985, 1).name(), "戊寅");
    }

    #[test]
    fn test_day_pillar_known_dates() {
        assert_eq!(day_pillar(date(2000, 1, 1)).name(), "戊午");
        assert_eq!(day_pillar(date(2000, 1, 2)).name(), "己未");
        assert_eq!(day_pillar(date(1999, 12, 31)).name(), "丁巳");
        // sixty days later the cycle repeats
        assert_eq!(day_pillar(date(2000, 3, 1)), day_pillar(date(2000, 1, 1)));
    }

    #[test]
    fn test_hour_pillar() {
        // 甲 day, 子 hour is 甲子
        assert_eq!(hour_pillar(0, 0).name(), "甲子");
        assert_eq!(hour_pillar(23, 0).name(), "甲子");
        assert_eq!(hour_pillar(12, 0).name(), "庚午");
        // 乙 day starts at 丙子
        assert_eq!(hour_pillar(0, 1).name(), "丙子");
    }

    #[test]
    fn test_calculate_payload() {
        let mut input = Payload::new();
        input.insert("birth_date".into(), json!("1990-01-15"));
        input.insert("birth_time".into(), json!("14:30"));
        input.insert("gender".into(), json!("男"));

        let output = BaziCalculator.calculate(&input).unwrap();
        let counts = output["five_elements"].as_object().unwrap();
        let total: u64 = counts.values().map(|v| v.as_u64().unwrap()).sum();
        assert_eq!(total, 8);
        assert_eq!(output["four_pillars"]["year"], json!("庚午"));
        assert_eq!(output["birth_info"]["hour"], json!(14));
        let yin_yang = &output["yin_yang"];
        assert_eq!(
            yin_yang["阳"].as_u64().unwrap() + yin_yang["阴"].as_u64().unwrap(),
            8
        );
        assert_eq!(output["gender"], json!("男"));
    }

    #[test]
    fn test_missing_time_defaults_to_noon() {
        let mut input = Payload::new();
        input.insert("birth_date".into(), json!("2000-01-01"));
        let output = BaziCalculator.calculate(&input).unwrap();
        assert_eq!(output["birth_info"]["hour"], json!(12));
        assert_eq!(output["day_master"], json!("戊"));
    }

    #[test]
    fn test_rejects_bad_dates() {
        let mut input = Payload::new();
        assert_eq!(
            BaziCalculator.calculate(&input).unwrap_err(),
            CalcError::MissingField("birth_date".into())
        );
        input.insert("birth_date".into(), json!("1990-13-01"));
        assert!(BaziCalculator.calculate(&input).is_err());
    }
}
