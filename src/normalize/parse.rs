//! Free-text parsing helpers for scraped listing fields

use crate::types::{Floor, GeoPoint};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// How a lone separator followed by three digits is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberStyle {
    /// "125.000" is one hundred twenty-five thousand
    Price,
    /// "65.000" is sixty-five
    Measure,
}

/// Lowercase, fold Serbian Latin diacritics and collapse whitespace
pub fn fold(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        match c {
            'š' => folded.push('s'),
            'đ' => folded.push_str("dj"),
            'č' | 'ć' => folded.push('c'),
            'ž' => folded.push('z'),
            _ => folded.push(c),
        }
    }
    collapse_whitespace(&folded)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the first number from free text, tolerating `.` and `,` as either
/// thousands or decimal separators.
pub fn parse_number(text: &str, style: NumberStyle) -> Option<Decimal> {
    // "125 000" and "125\u{a0}000" are one number
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let start = compact.find(|c: char| c.is_ascii_digit())?;
    let token: String = compact[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let token = token.trim_end_matches(['.', ',']);

    let dots = token.matches('.').count();
    let commas = token.matches(',').count();

    let normalized = match (dots, commas) {
        (0, 0) => token.to_string(),
        (_, 0) | (0, _) => {
            let sep = if dots > 0 { '.' } else { ',' };
            let count = dots + commas;
            let tail = token.rsplit(sep).next().unwrap_or("");
            let thousands = count > 1 || (style == NumberStyle::Price && tail.len() == 3);
            if thousands {
                token.replace(sep, "")
            } else {
                token.replace(sep, ".")
            }
        }
        _ => {
            // Both present: the last one is the decimal separator
            let last_dot = token.rfind('.').unwrap_or(0);
            let last_comma = token.rfind(',').unwrap_or(0);
            if last_dot > last_comma {
                token.replace(',', "")
            } else {
                token.replace('.', "").replace(',', ".")
            }
        }
    };

    Decimal::from_str(&normalized).ok()
}

/// Currency code named by the currency field or the price text
pub fn detect_currency(price_text: &str, currency_field: Option<&str>) -> Option<String> {
    if let Some(field) = currency_field.map(fold).filter(|f| !f.is_empty()) {
        return Some(currency_code(&field).unwrap_or_else(|| field.to_uppercase()));
    }
    let folded = fold(price_text);
    folded
        .split(|c: char| !c.is_alphabetic() && c != '€' && c != '$')
        .filter(|t| !t.is_empty())
        .find_map(currency_code)
        .or_else(|| {
            if folded.contains('€') {
                Some("EUR".to_string())
            } else if folded.contains('$') {
                Some("USD".to_string())
            } else {
                None
            }
        })
}

fn currency_code(token: &str) -> Option<String> {
    let code = match token {
        "€" | "eur" | "euro" | "evra" | "evro" => "EUR",
        "rsd" | "din" | "din." | "dinara" | "dinar" => "RSD",
        "$" | "usd" => "USD",
        _ => return None,
    };
    Some(code.to_string())
}

/// Parse room count; studio flats count as half a room
pub fn parse_rooms(text: &str) -> Option<Decimal> {
    let folded = fold(text);
    if folded.contains("garsonjer") || folded.contains("studio") {
        return Some(Decimal::new(5, 1));
    }
    parse_number(&folded, NumberStyle::Measure).filter(|r| *r > Decimal::ZERO)
}

/// Parse floor text such as "prizemlje", "III/5", "poslednji sprat bez lifta".
///
/// Returns the floor and the building's floor count when it was given inline.
pub fn parse_floor(text: &str, total_text: Option<&str>) -> (Floor, Option<i16>) {
    let folded = fold(text);
    let mut total = total_text.and_then(|t| parse_level(&fold(t)));

    let floor = if folded.contains("poslednji") || folded.contains("potkrovlje") {
        Floor::Top {
            elevator: !folded.contains("bez lifta"),
        }
    } else if folded.contains("prizemlje") {
        Floor::Level(0)
    } else if folded.contains("suteren") || folded.contains("podrum") {
        Floor::Level(-1)
    } else {
        let mut parts = folded.splitn(2, '/');
        let level = parts.next().and_then(|p| parse_level(p.trim()));
        if let Some(inline_total) = parts.next().and_then(|p| parse_level(p.trim())) {
            total = Some(inline_total);
        }
        match level {
            Some(level) => Floor::Level(level),
            None => Floor::Unknown,
        }
    };

    let floor = match (floor, total) {
        (Floor::Level(level), Some(total)) if level > 0 && level == total => Floor::Top {
            elevator: total > 5,
        },
        (floor, _) => floor,
    };

    (floor, total)
}

fn parse_level(token: &str) -> Option<i16> {
    let token = token.trim().trim_end_matches("sprat").trim().trim_end_matches('.');
    match token {
        "pr" | "vpr" | "visoko prizemlje" => return Some(0),
        "sut" | "pod" => return Some(-1),
        _ => {}
    }
    if let Ok(n) = token.parse::<i16>() {
        return Some(n);
    }
    parse_roman(token)
}

/// Storey numbers in roman numerals; long runs are free text, not floors
fn parse_roman(token: &str) -> Option<i16> {
    if token.is_empty() || token.len() > 8 {
        return None;
    }
    let values: Option<Vec<i16>> = token
        .chars()
        .map(|c| match c {
            'i' => Some(1),
            'v' => Some(5),
            'x' => Some(10),
            'l' => Some(50),
            _ => None,
        })
        .collect();
    let values = values?;

    let mut total: i16 = 0;
    for (i, value) in values.iter().enumerate() {
        total = match values.get(i + 1) {
            Some(next) if next > value => total.checked_sub(*value)?,
            _ => total.checked_add(*value)?,
        };
    }
    (total > 0).then_some(total)
}

/// Construction year from text such as "1978", "izgradjeno 2019." or "2027 (u izgradnji)".
/// Years before 1800 or more than five years past `as_of` are noise.
pub fn parse_year(text: &str, as_of: DateTime<Utc>) -> Option<i32> {
    let latest = as_of.year() + 5;
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| run.len() == 4)
        .filter_map(|run| run.parse::<i32>().ok())
        .find(|year| (1800..=latest).contains(year))
}

pub fn parse_geo(lat: Option<&str>, lon: Option<&str>) -> Option<GeoPoint> {
    let lat: f64 = lat?.trim().replace(',', ".").parse().ok()?;
    let lon: f64 = lon?.trim().replace(',', ".").parse().ok()?;
    let valid = lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0;
    // 0,0 is what broken geocoders emit
    (valid && !(lat == 0.0 && lon == 0.0)).then_some(GeoPoint { lat, lon })
}

/// A phone is present when the text carries at least six digits
pub fn has_phone(text: Option<&str>) -> bool {
    text.map(|t| t.chars().filter(|c| c.is_ascii_digit()).count() >= 6)
        .unwrap_or(false)
}

pub fn is_truthy(text: &str) -> bool {
    matches!(
        fold(text).as_str(),
        "1" | "true" | "yes" | "da" | "hitno" | "urgent" | "y"
    )
}
