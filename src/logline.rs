//! Parsing of raw service log lines into structured entries

use crate::service::ServiceId;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::LazyLock;

/// CSI sequences, OSC sequences and two-byte escapes
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI pattern")
});

/// `[anything]` or a bare ISO-like timestamp at the start of the line
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\[([^\]]{10,40})\]|(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?))\s*",
    )
    .expect("valid timestamp pattern")
});

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:error|fatal|panic)").expect("valid level pattern"));
static WARN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwarn").expect("valid level pattern"));
static INFO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binfo\b").expect("valid level pattern"));
static DEBUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:debug|trace)\b").expect("valid level pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Unknown,
}

/// One parsed line of a service log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub service: ServiceId,
    pub level: LogLevel,
    pub message: String,
    /// The line as written, escapes included
    pub raw: String,
}

pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    if !line.contains('\x1b') {
        return Cow::Borrowed(line);
    }
    ANSI_RE.replace_all(line, "")
}

/// Parse one line; `now` stands in when the line carries no timestamp
pub fn parse_line(service: ServiceId, raw: &str, now: DateTime<Utc>) -> LogEntry {
    let clean = strip_ansi(raw);
    let (timestamp, message) = match split_timestamp(&clean) {
        Some((ts, rest)) => (ts, rest),
        None => (now, clean.trim_start()),
    };
    let message = message.trim_end().to_string();

    LogEntry {
        timestamp,
        service,
        level: infer_level(&message),
        message,
        raw: raw.to_string(),
    }
}

/// Leading timestamp and the rest of the line
fn split_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let captures = TIMESTAMP_RE.captures(line)?;
    let text = captures.get(1).or_else(|| captures.get(2))?.as_str();
    let timestamp = parse_timestamp(text.trim())?;
    let consumed = captures.get(0)?.end();
    Some((timestamp, &line[consumed..]))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.replace(',', ".");
    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(&text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    // Zone-less timestamps are taken as UTC
    let naive = text.trim_end_matches('Z');
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(ts.and_utc());
        }
    }
    None
}

pub fn infer_level(message: &str) -> LogLevel {
    if ERROR_RE.is_match(message) {
        LogLevel::Error
    } else if WARN_RE.is_match(message) {
        LogLevel::Warn
    } else if INFO_RE.is_match(message) {
        LogLevel::Info
    } else if DEBUG_RE.is_match(message) {
        LogLevel::Debug
    } else {
        LogLevel::Unknown
    }
}
