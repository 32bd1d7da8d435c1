//! Timestamp parsing at the transport boundary.
//!
//! Accepted inputs, all normalised to UTC unix milliseconds:
//! - integer milliseconds: `1740052800000`
//! - timezone-aware RFC 3339: `2025-02-20T12:00:00-06:00`, `2025-02-20T18:00:00Z`
//! - timezone-naive, read as UTC: `2025-02-20 18:00:00`, `2025-02-20T18:00`

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::model::Ms;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const AWARE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"];

#[derive(Debug, PartialEq, Eq)]
pub struct TimeError(pub String);

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad timestamp: {}", self.0)
    }
}

impl std::error::Error for TimeError {}

pub fn parse_timestamp(input: &str) -> Result<Ms, TimeError> {
    let s = input.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in AWARE_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc).timestamp_millis());
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(TimeError(input.to_string()))
}

/// RFC 3339 rendering in UTC with second precision.
pub fn format_timestamp(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => ms.to_string(),
    }
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}
