//! Event datetimes produced by parse rules.
//!
//! A parse rule may see a malformed date; it still returns a tuple carrying an
//! [`EventTime::Invalid`], and the transform stage rejects it. This keeps a bad
//! date a transform error attributed to the token rather than a parse error.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// A parsed datetime, or the reason it could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum EventTime {
    /// A real instant with its original UTC offset
    Valid(DateTime<FixedOffset>),
    /// Explanation of why the input was not a datetime
    Invalid(String),
}

impl EventTime {
    /// RFC 3339 / ISO 8601 with offset, e.g. `2021-05-01T10:00:00+02:00`.
    pub fn from_rfc3339(s: &str) -> Self {
        match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(dt) => EventTime::Valid(dt),
            Err(e) => EventTime::Invalid(format!("invalid RFC 3339 datetime {:?}: {}", s, e)),
        }
    }

    /// SQL-style `YYYY-MM-DD HH:MM:SS[.fff]` in UTC, optionally suffixed with ` UTC`.
    pub fn from_sql(s: &str) -> Self {
        let trimmed = s.trim().trim_end_matches(" UTC");
        match NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
            Ok(naive) => EventTime::Valid(Utc.from_utc_datetime(&naive).fixed_offset()),
            Err(e) => EventTime::Invalid(format!("invalid SQL datetime {:?}: {}", s, e)),
        }
    }

    /// Seconds since the Unix epoch.
    pub fn from_unix_seconds(secs: f64) -> Self {
        if !secs.is_finite() {
            return EventTime::Invalid(format!("non-finite timestamp {}", secs));
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        match DateTime::<Utc>::from_timestamp(whole as i64, nanos) {
            Some(dt) => EventTime::Valid(dt.fixed_offset()),
            None => EventTime::Invalid(format!("timestamp out of range: {}", secs)),
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn from_unix_millis(ms: f64) -> Self {
        Self::from_unix_seconds(ms / 1000.0)
    }

    /// A `strftime` pattern. Patterns without an offset are read as UTC and
    /// patterns without a time as midnight.
    pub fn from_format(s: &str, fmt: &str) -> Self {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return EventTime::Valid(dt);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return EventTime::Valid(Utc.from_utc_datetime(&naive).fixed_offset());
        }
        match NaiveDate::parse_from_str(s, fmt) {
            Ok(date) => {
                let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
                EventTime::Valid(Utc.from_utc_datetime(&naive).fixed_offset())
            }
            Err(e) => EventTime::Invalid(format!("{:?} does not match {:?}: {}", s, fmt, e)),
        }
    }

    /// Seconds since the epoch, fractional part kept.
    pub fn timestamp(&self) -> Result<f64, String> {
        match self {
            EventTime::Valid(dt) => {
                Ok(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9)
            }
            EventTime::Invalid(reason) => Err(reason.clone()),
        }
    }

    /// ISO date in the datetime's own offset.
    pub fn day(&self) -> Result<String, String> {
        match self {
            EventTime::Valid(dt) => Ok(dt.date_naive().format("%Y-%m-%d").to_string()),
            EventTime::Invalid(reason) => Err(reason.clone()),
        }
    }
}

impl From<DateTime<FixedOffset>> for EventTime {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        EventTime::Valid(dt)
    }
}

impl From<DateTime<Utc>> for EventTime {
    fn from(dt: DateTime<Utc>) -> Self {
        EventTime::Valid(dt.fixed_offset())
    }
}
