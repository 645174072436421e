use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::utils::time::{format_timestamp, parse_timestamp_strict};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_sql_datetime(value: &DateTime<Utc>) -> String {
    format_timestamp(value)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    parse_timestamp_strict(value).with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_evidence(value: &str) -> Result<Vec<String>> {
    serde_json::from_str(value).context("failed to parse evidence list")
}
