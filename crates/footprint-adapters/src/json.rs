//! Small readers over loosely typed upstream JSON.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub fn at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

/// Reads `path` with `read`, keeping track of whether the payload carried
/// the key at all: `None` when absent, JSON null when present but empty or
/// unreadable.
pub fn present<'a, T: Into<JsonValue>>(
    value: &'a JsonValue,
    path: &[&str],
    read: impl Fn(&'a JsonValue, &[&str]) -> Option<T>,
) -> Option<JsonValue> {
    at(value, path)?;
    Some(read(value, path).map_or(JsonValue::Null, Into::into))
}

/// Non-empty trimmed string at `path`.
pub fn str_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    at(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn i64_at(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = at(value, path)?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f.round() as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub fn f64_at(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let v = at(value, path)?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub fn bool_at(value: &JsonValue, path: &[&str]) -> Option<bool> {
    let v = at(value, path)?;
    v.as_bool().or_else(|| match v.as_str()?.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    })
}

/// Identifier that upstream may send as a number or a string.
pub fn id_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    let v = at(value, path)?;
    match v {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]` (read as UTC) or a bare date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn timestamp_at(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    str_at(value, path).and_then(parse_timestamp)
}

/// Duration text such as `"45m"`, `"1h 5m"`, `"1 hr 5 mins"` or `"12"`,
/// in whole minutes.
pub fn parse_minutes(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return None;
    }
    if let Ok(bare) = raw.parse::<f64>() {
        return Some(bare.round() as i64);
    }

    let mut total = 0f64;
    let mut matched = false;
    let mut number = String::new();
    let mut unit = String::new();
    let mut flush = |number: &mut String, unit: &mut String| -> bool {
        if number.is_empty() {
            unit.clear();
            return true;
        }
        let Ok(n) = number.parse::<f64>() else {
            return false;
        };
        let factor = match unit.as_str() {
            "h" | "hr" | "hrs" | "hour" | "hours" => 60.0,
            "m" | "min" | "mins" | "minute" | "minutes" | "" => 1.0,
            "s" | "sec" | "secs" | "second" | "seconds" => 1.0 / 60.0,
            _ => return false,
        };
        total += n * factor;
        matched = true;
        number.clear();
        unit.clear();
        true
    };

    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            if !unit.is_empty() && !flush(&mut number, &mut unit) {
                return None;
            }
            number.push(ch);
        } else if ch.is_alphabetic() {
            unit.push(ch);
        } else if !ch.is_whitespace() && ch != ',' {
            return None;
        }
    }
    if !flush(&mut number, &mut unit) {
        return None;
    }
    matched.then(|| total.round() as i64)
}

/// Deterministic key for upstream rows without an identifier of their own.
pub fn composite_key(parts: &[&str]) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, parts.join("\u{1f}").as_bytes()).to_string()
}
