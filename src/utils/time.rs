//! Timestamp parsing and elapsed-time arithmetic.
//!
//! This is the only place the elapsed formula lives:
//! `elapsed = max(0, end - start - paused)`. The repository, the client store,
//! the foreground ticker and the background wake all call into here.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::warn;

const MS_PER_MINUTE: u64 = 60_000;

/// Formats accepted when the input carries no zone or offset. Such values are
/// read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses `value` as RFC 3339, falling back to a zone-less timestamp that is
/// interpreted as UTC. Unparseable input degrades to the current time so a
/// malformed value never blocks the timer display.
pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    match parse_timestamp_strict(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("{err}; falling back to now");
            Utc::now()
        }
    }
}

/// Same grammar as [`parse_timestamp`] but reports garbage instead of
/// substituting the current time.
pub fn parse_timestamp_strict(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    bail!("invalid timestamp '{value}'")
}

/// Canonical wire/storage form: RFC 3339, millisecond precision, `Z` suffix.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds between `start` and `end` minus `paused_ms`, never negative.
pub fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>, paused_ms: u64) -> u64 {
    let span = end.signed_duration_since(start).num_milliseconds();
    let paused = i64::try_from(paused_ms).unwrap_or(i64::MAX);
    span.saturating_sub(paused).max(0) as u64
}

pub fn elapsed_now(start: DateTime<Utc>, paused_ms: u64) -> u64 {
    elapsed_between(start, Utc::now(), paused_ms)
}

/// Length of one completed pause interval.
pub fn pause_duration_ms(paused_at: DateTime<Utc>, resumed_at: DateTime<Utc>) -> u64 {
    elapsed_between(paused_at, resumed_at, 0)
}

/// Rounds half-up to whole minutes.
pub fn whole_minutes(elapsed_ms: u64) -> i64 {
    let minutes = elapsed_ms.saturating_add(MS_PER_MINUTE / 2) / MS_PER_MINUTE;
    i64::try_from(minutes).unwrap_or(i64::MAX)
}

/// `HH:MM:SS`; the hour field grows past two digits rather than wrapping.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    let total_secs = elapsed_ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Serde adapter that reads timestamps through [`parse_timestamp`].
pub mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(super::parse_timestamp(&raw))
    }
}

/// Optional counterpart of [`lenient`]; pair with `#[serde(default)]`.
pub mod lenient_option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_some(&super::format_timestamp(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|value| super::parse_timestamp(&value)))
    }
}
