//! Field-level normalizers. Each returns `None` for values it cannot make
//! sense of or that fall outside a plausible range; none of them fail.

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;

use super::domain::ResultStatus;

/// Height range in centimetres.
pub const HEIGHT_CM: (f64, f64) = (140.0, 220.0);
/// Weight range in kilograms.
pub const WEIGHT_KG: (f64, f64) = (40.0, 120.0);
/// Distance range in kilometres.
pub const DISTANCE_KM: (f64, f64) = (0.0, 1000.0);
/// Elevation gain range in metres.
pub const ELEVATION_M: (f64, f64) = (0.0, 10_000.0);

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%B %d, %Y", "%d %B %Y", "%b %d, %Y", "%d %b %Y",
    "%Y/%m/%d",
];

const PARTICLES: &[&str] = &[
    "van", "der", "den", "de", "del", "della", "di", "da", "das", "dos", "du", "la", "le", "von", "ter", "ten",
];

fn number_with_unit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*(\d{1,3}(?:,\d{3})+|\d+(?:[.,]\d+)?)\s*([a-z'"]*)"#).expect("static pattern")
    })
}

fn clock_time() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):(\d{1,2})(?::(\d{1,2}))?$").expect("static pattern"))
}

fn unit_time() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(?:(\d+)\s*h)?\s*(?:(\d+)\s*(?:'|m|min))?\s*(?:(\d+)\s*(?:"|''|s|sec))?$"#)
            .expect("static pattern")
    })
}

/// Split "3,600 m" / "1.76m" / "68 kg" into a number and a lowercase unit.
fn split_measure(raw: &str) -> Option<(f64, String)> {
    let lc = raw.trim().to_lowercase();
    let caps = number_with_unit().captures(&lc)?;
    let digits = &caps[1];
    // "3,600" is a thousands separator, "1,83" a decimal comma.
    let normalized = if digits.contains(',') && digits.split(',').skip(1).all(|g| g.len() == 3) {
        digits.replace(',', "")
    } else {
        digits.replace(',', ".")
    };
    let value: f64 = normalized.parse().ok()?;
    Some((value, caps[2].to_string()))
}

fn in_range(v: f64, (lo, hi): (f64, f64)) -> bool {
    v.is_finite() && v >= lo && v <= hi
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Strip diacritics from Latin letters, keeping case.
pub fn remove_diacritics(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        let lower = ch.to_lowercase().next().unwrap_or(ch);
        let base: &str = match lower {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
            'ç' | 'ć' | 'č' => "c",
            'ď' | 'đ' => "d",
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
            'ğ' => "g",
            'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
            'ł' | 'ľ' | 'ĺ' => "l",
            'ñ' | 'ń' | 'ň' => "n",
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
            'ŕ' | 'ř' => "r",
            'ś' | 'š' | 'ş' | 'ș' => "s",
            'ť' | 'ţ' | 'ț' => "t",
            'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
            'ý' | 'ÿ' => "y",
            'ź' | 'ż' | 'ž' => "z",
            'ß' => "ss",
            'æ' => "ae",
            'œ' => "oe",
            'þ' => "th",
            _ => {
                out.push(ch);
                continue;
            }
        };
        if ch.is_uppercase() {
            let mut cs = base.chars();
            if let Some(first) = cs.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(cs.as_str());
            }
        } else {
            out.push_str(base);
        }
    }
    out
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize_part(part: &str) -> String {
    let mut cs = part.chars();
    match cs.next() {
        Some(first) => first.to_uppercase().chain(cs.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

fn title_word(word: &str, first: bool) -> String {
    let lower = word.to_lowercase();
    if !first && PARTICLES.contains(&lower.as_str()) {
        return lower;
    }
    let mut out = String::with_capacity(word.len());
    let mut part = String::new();
    for ch in word.chars() {
        if ch == '-' || ch == '\'' {
            out.push_str(&capitalize_part(&part));
            out.push(ch);
            part.clear();
        } else {
            part.push(ch);
        }
    }
    out.push_str(&capitalize_part(&part));
    out
}

fn is_upper_word(word: &str) -> bool {
    let letters: Vec<char> = word.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() > 1 && letters.iter().all(|c| c.is_uppercase())
}

/// Canonical rider name split into first and last name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiderName {
    /// "First Last" display form.
    pub full: String,
    /// Given name(s).
    pub first: String,
    /// Family name, including particles.
    pub last: String,
}

/// Normalize a rider name: diacritics removed, whitespace collapsed, title
/// case with lowercase particles, and `SURNAME Given` reordered to
/// `Given Surname`.
pub fn standardize_rider_name(raw: &str) -> Option<RiderName> {
    let cleaned = collapse_ws(&remove_diacritics(raw));
    let words: Vec<&str> = cleaned.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return None;
    }
    let upper_run = words.iter().take_while(|w| is_upper_word(w)).count();
    let ordered: Vec<&str> = if upper_run > 0 && upper_run < words.len() {
        words[upper_run..].iter().chain(words[..upper_run].iter()).copied().collect()
    } else {
        words
    };
    let titled: Vec<String> = ordered.iter().enumerate().map(|(i, w)| title_word(w, i == 0)).collect();
    let full = titled.join(" ");
    if titled.len() == 1 {
        return Some(RiderName { first: String::new(), last: full.clone(), full });
    }
    let split = titled
        .iter()
        .skip(1)
        .position(|w| PARTICLES.contains(&w.as_str()))
        .map(|p| p + 1)
        .unwrap_or(titled.len() - 1);
    Some(RiderName {
        first: titled[..split].join(" "),
        last: titled[split..].join(" "),
        full,
    })
}

/// Normalized display name (see [`standardize_rider_name`]).
pub fn standardize_name(raw: &str) -> Option<String> {
    standardize_rider_name(raw).map(|n| n.full)
}

/// Free text such as team and race names keeps its casing; only whitespace
/// is normalized.
pub fn standardize_text(raw: &str) -> Option<String> {
    let s = collapse_ws(raw);
    (!s.is_empty()).then_some(s)
}

/// Two or three letter codes are uppercased; country names are title-cased.
pub fn standardize_nationality(raw: &str) -> Option<String> {
    let s = collapse_ws(&remove_diacritics(raw));
    if s.is_empty() {
        return None;
    }
    if (2..=3).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(s.to_ascii_uppercase());
    }
    Some(s.split(' ').enumerate().map(|(i, w)| title_word(w, i == 0)).collect::<Vec<_>>().join(" "))
}

/// Parse a date in any of the supported formats.
pub fn standardize_date(raw: &str) -> Option<NaiveDate> {
    // Trailing "(26)" age markers and ordinal suffixes are common on profile pages.
    let base = raw.split('(').next().unwrap_or(raw);
    let mut s = collapse_ws(base);
    for suffix in ["st ", "nd ", "rd ", "th "] {
        if let Some(idx) = s.find(suffix) {
            if idx > 0 && s[..idx].chars().last().is_some_and(|c| c.is_ascii_digit()) {
                s.replace_range(idx..idx + 2, "");
            }
        }
    }
    if s.len() > 10 && s.as_bytes().get(10) == Some(&b'T') {
        s.truncate(10);
    }
    DATE_FORMATS.iter().find_map(|f| NaiveDate::parse_from_str(&s, f).ok())
}

/// Normalize a finishing time or gap to `HH:MM:SS`. "Same time" markers
/// become `00:00:00`.
pub fn standardize_time(raw: &str) -> Option<String> {
    let s = raw.trim().trim_start_matches('+').trim().to_lowercase();
    if matches!(s.as_str(), "same time" | "s.t." | "s.t" | "st" | ",," | "-") {
        return Some("00:00:00".into());
    }
    if s.is_empty() {
        return None;
    }
    let (h, m, sec) = if let Some(c) = clock_time().captures(&s) {
        let h: u64 = c[1].parse().ok()?;
        let m: u64 = c[2].parse().ok()?;
        let sec: u64 = match c.get(3) {
            Some(v) => v.as_str().parse().ok()?,
            None => 0,
        };
        (h, m, sec)
    } else if let Some(c) = unit_time().captures(&s) {
        let part = |i: usize| c.get(i).map(|v| v.as_str().parse::<u64>().ok()).unwrap_or(Some(0));
        if c.get(1).is_none() && c.get(2).is_none() && c.get(3).is_none() {
            return None;
        }
        (part(1)?, part(2)?, part(3)?)
    } else {
        return None;
    };
    if m >= 60 || sec >= 60 {
        return None;
    }
    Some(format!("{h:02}:{m:02}:{sec:02}"))
}

/// Height in whole centimetres. Metres and inches are converted; values
/// below 3 without a unit are read as metres.
pub fn standardize_height(raw: &str) -> Option<u32> {
    let (v, unit) = split_measure(raw)?;
    let cm = match unit.as_str() {
        "m" => v * 100.0,
        "in" | "inch" | "inches" | "\"" => v * 2.54,
        "" if v < 3.0 => v * 100.0,
        "" | "cm" => v,
        _ => return None,
    };
    let cm = cm.round();
    in_range(cm, HEIGHT_CM).then_some(cm as u32)
}

/// Weight in kilograms, one decimal. Pounds are converted.
pub fn standardize_weight(raw: &str) -> Option<f64> {
    let (v, unit) = split_measure(raw)?;
    let kg = match unit.as_str() {
        "" | "kg" | "kgs" => v,
        "lb" | "lbs" => v * 0.453_592_37,
        _ => return None,
    };
    let kg = round1(kg);
    in_range(kg, WEIGHT_KG).then_some(kg)
}

/// Distance in kilometres, one decimal. Miles are converted.
pub fn standardize_distance(raw: &str) -> Option<f64> {
    let (v, unit) = split_measure(raw)?;
    let km = match unit.as_str() {
        "" | "km" | "k" => v,
        "mi" | "miles" => v * 1.609_344,
        _ => return None,
    };
    let km = round1(km);
    (km > 0.0 && in_range(km, DISTANCE_KM)).then_some(km)
}

/// Elevation gain in whole metres. Feet are converted.
pub fn standardize_elevation(raw: &str) -> Option<u32> {
    let (v, unit) = split_measure(raw)?;
    let m = match unit.as_str() {
        "" | "m" => v,
        "ft" | "feet" => v * 0.3048,
        _ => return None,
    };
    let m = m.round();
    in_range(m, ELEVATION_M).then_some(m as u32)
}

/// A year between 1900 and next year, taken from the first number in `raw`.
pub fn standardize_year(raw: &str) -> Option<i32> {
    let y = i32::try_from(standardize_stage(raw)?).ok()?;
    (1900..=Utc::now().year() + 1).contains(&y).then_some(y)
}

/// Non-negative counter; thousands separators and trailing text are ignored.
pub fn standardize_count(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// First unsigned integer found in `raw`, e.g. the stage number in "Stage 12".
pub fn standardize_stage(raw: &str) -> Option<u32> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Status code lookup defaulting to `Finished`.
pub fn standardize_status(raw: &str) -> ResultStatus {
    ResultStatus::lookup(raw)
}
