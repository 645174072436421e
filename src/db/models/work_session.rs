//! Server-side work session record and the payloads that mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::{elapsed_between, lenient, lenient_option};

/// One clock-in/clock-out instance. `start_time` never changes after
/// creation; `total_paused_ms` only grows, and only on resume (or when an
/// open pause is folded in at stop/restart).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub user_id: String,
    #[serde(with = "lenient")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "lenient_option")]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_paused: bool,
    #[serde(default, with = "lenient_option")]
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused_ms: u64,
    pub duration_minutes: Option<i64>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<f64>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(with = "lenient")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "lenient")]
    pub updated_at: DateTime<Utc>,
}

impl WorkSession {
    /// Worked time as of `now`. A paused session is frozen at `paused_at`
    /// and a stopped one at `end_time`.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = match (self.paused_at, self.end_time) {
            (Some(paused_at), _) => paused_at,
            (None, Some(end_time)) => end_time,
            (None, None) => now,
        };
        elapsed_between(self.start_time, end, self.total_paused_ms)
    }
}

/// Fields accepted when clocking in.
#[derive(Debug, Clone, Default)]
pub struct NewWorkSession {
    /// Defaults to the server clock when absent.
    pub start_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<f64>,
}

/// Descriptive fields carried through unchanged by the state machine.
/// `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub description: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<f64>,
    pub evidence: Option<Vec<String>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.location.is_none()
            && self.hourly_rate.is_none()
            && self.evidence.is_none()
    }
}

/// Finalize-time payload for stop.
#[derive(Debug, Clone, Default)]
pub struct StopFields {
    /// Replaces the computed duration when present.
    pub duration_minutes: Option<i64>,
    pub update: SessionUpdate,
}
