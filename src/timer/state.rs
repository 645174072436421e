use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::WorkSession;
use crate::utils::time::{elapsed_between, lenient_option};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Local mirror of the server's active session.
///
/// `start_time`, `paused_at` and `accumulated_ms` are copied from the last
/// confirmed server snapshot and are the only inputs to the elapsed formula.
/// `elapsed_ms` is a display cache: tickers and background wakes overwrite
/// it freely and nothing reads it back as a formula input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientTimerState {
    pub status: TimerStatus,
    pub session_id: Option<String>,
    #[serde(with = "lenient_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "lenient_option")]
    pub paused_at: Option<DateTime<Utc>>,
    /// Mirrors the server's `totalPausedMs`.
    pub accumulated_ms: u64,
    pub elapsed_ms: u64,
    #[serde(with = "lenient_option")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl ClientTimerState {
    /// Builds the mirror from a server snapshot. Anything other than an
    /// active session collapses to idle defaults.
    pub fn from_session(session: Option<&WorkSession>, now: DateTime<Utc>) -> Self {
        let session = match session {
            Some(session) if session.is_active => session,
            _ => {
                return Self {
                    synced_at: Some(now),
                    ..Self::default()
                }
            }
        };

        let status = if session.is_paused {
            TimerStatus::Paused
        } else {
            TimerStatus::Running
        };

        let mut state = Self {
            status,
            session_id: Some(session.id.clone()),
            start_time: Some(session.start_time),
            paused_at: if session.is_paused { session.paused_at } else { None },
            accumulated_ms: session.total_paused_ms,
            elapsed_ms: 0,
            synced_at: Some(now),
        };
        state.elapsed_ms = state.elapsed_at(now);
        state
    }

    /// Elapsed worked time at `now`, always recomputed from the formula
    /// inputs. A paused timer reads as frozen at `paused_at`.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.start_time) {
            (TimerStatus::Running, Some(start)) => elapsed_between(start, now, self.accumulated_ms),
            (TimerStatus::Paused, Some(start)) => {
                let frozen_at = self.paused_at.unwrap_or(now);
                elapsed_between(start, frozen_at, self.accumulated_ms)
            }
            _ => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TimerStatus::Running
    }

    pub fn is_idle(&self) -> bool {
        self.status == TimerStatus::Idle
    }
}
