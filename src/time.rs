//! Conversions between client-facing ISO-8601 text and [`Ms`].
//!
//! Instants carry no zone: `2024-01-01T09:00` is stored as the wall-clock
//! milliseconds of that reading. Offsets in RFC 3339 input are normalized to UTC.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};

use crate::model::{Ms, Span};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn parse_instant(text: &str) -> Result<Ms, String> {
    let text = text.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(to_ms(dt));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(to_ms(date.and_time(chrono::NaiveTime::MIN)));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(to_ms(dt.naive_utc()));
    }
    Err(format!("invalid ISO-8601 date-time: {text:?}"))
}

fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

fn from_ms(ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM:SS`
pub fn format_instant(ms: Ms) -> String {
    from_ms(ms).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `YYYY-MM-DD HH:MM - HH:MM`. The end omits its date even when it falls on a
/// later day.
pub fn format_range(span: &Span) -> String {
    format!(
        "{} - {}",
        from_ms(span.start).format("%Y-%m-%d %H:%M"),
        from_ms(span.end).format("%H:%M")
    )
}

/// Current local wall-clock time.
pub fn now_ms() -> Ms {
    to_ms(Local::now().naive_local())
}
