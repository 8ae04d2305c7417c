//! Structured log extraction.
//!
//! A line that decodes as a flat JSON object of string values is mined for a severity
//! level and a timestamp; the remaining fields are flattened into `key=value` pairs.
//! Anything else is passed through verbatim.
//!
//! Fields are scanned in lexicographic key order and the first match wins, for the
//! level and for the timestamp independently. Only the winning fields are removed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde_json::Value;

/// Format used to render extracted timestamps.
pub const TIME_FORMAT: &str = "%H:%M:%S";

// Offset-carrying layouts; the wall-clock time is kept as written.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%d/%b/%Y:%H:%M:%S %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%d %b %Y %H:%M:%S%.f",
    "%b %d %Y %H:%M:%S%.f",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Severity extracted from a structured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Matches a severity token, ignoring case.
    pub fn from_token(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of extracting a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredLog {
    pub level: Option<Level>,
    pub timestamp: Option<NaiveDateTime>,
    /// Remaining fields as `key=value` pairs, or the original line.
    pub parsed: String,
}

impl StructuredLog {
    fn verbatim(line: &str) -> Self {
        Self {
            level: None,
            timestamp: None,
            parsed: line.to_string(),
        }
    }

    /// Renders as ` [HH:MM:SS] [LEVEL] parsed`, omitting absent parts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(timestamp) = &self.timestamp {
            out.push_str(&format!(" [{}]", timestamp.format(TIME_FORMAT)));
        }
        if let Some(level) = self.level {
            out.push_str(&format!(" [{}]", level));
        }
        out.push(' ');
        out.push_str(&self.parsed);
        out
    }
}

/// Extracts level, timestamp and flattened fields from `line`.
pub fn parse(line: &str) -> StructuredLog {
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(line) else {
        return StructuredLog::verbatim(line);
    };
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let Value::String(value) = value else {
            return StructuredLog::verbatim(line);
        };
        fields.insert(key, value);
    }

    let mut level = None;
    let mut timestamp = None;
    for (key, value) in &fields {
        if level.is_none() {
            if let Some(found) = Level::from_token(value) {
                level = Some((key.clone(), found));
                continue;
            }
        }
        if timestamp.is_none() {
            if let Some(found) = parse_timestamp(value) {
                timestamp = Some((key.clone(), found));
            }
        }
    }
    if let Some((key, _)) = &level {
        fields.remove(key);
    }
    if let Some((key, _)) = &timestamp {
        fields.remove(key);
    }

    let parsed = fields
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(" ");
    StructuredLog {
        level: level.map(|(_, level)| level),
        timestamp: timestamp.map(|(_, timestamp)| timestamp),
        parsed,
    }
}

/// Parses a date/time in any of the common layouts, keeping the wall-clock time.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.naive_local());
    }
    for format in ZONED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Some(parsed.naive_local());
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    parse_epoch(value)
}

// Unix epochs in seconds, milliseconds, microseconds or nanoseconds.
fn parse_epoch(value: &str) -> Option<NaiveDateTime> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let raw: i64 = value.parse().ok()?;
    let (secs, nanos) = match value.len() {
        10 => (raw, 0),
        13 => (raw / 1_000, (raw % 1_000) * 1_000_000),
        16 => (raw / 1_000_000, (raw % 1_000_000) * 1_000),
        19 => (raw / 1_000_000_000, raw % 1_000_000_000),
        _ => return None,
    };
    Local
        .timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.naive_local())
}
