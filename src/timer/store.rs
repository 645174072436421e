use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::db::WorkSession;

use super::state::ClientTimerState;

struct StoreInner {
    path: Option<PathBuf>,
    state: RwLock<ClientTimerState>,
}

/// Persisted client timer mirror. Cloning shares the same underlying state;
/// the orchestrator owns one and hands clones to the ticker and the
/// background wake.
#[derive(Clone)]
pub struct TimerStore {
    inner: Arc<StoreInner>,
}

fn read_state(path: &Path) -> Result<Option<ClientTimerState>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read timer state from {}", path.display()))?;
    match serde_json::from_str(&contents) {
        Ok(state) => Ok(Some(state)),
        Err(err) => {
            warn!(
                "Discarding unreadable timer state at {}: {err}",
                path.display()
            );
            Ok(None)
        }
    }
}

/// Temp file + rename so a killed process never leaves a torn file.
fn write_state(path: &Path, state: &ClientTimerState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(state)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serialized)
        .with_context(|| format!("Failed to write timer state to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move timer state into {}", path.display()))
}

impl TimerStore {
    /// File-backed store; starts from whatever the last process persisted.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = read_state(&path)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(StoreInner {
                path: Some(path),
                state: RwLock::new(state),
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: None,
                state: RwLock::new(ClientTimerState::default()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn snapshot(&self) -> ClientTimerState {
        match self.inner.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, ClientTimerState> {
        match self.inner.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, state: &ClientTimerState) -> Result<()> {
        match &self.inner.path {
            Some(path) => write_state(path, state),
            None => Ok(()),
        }
    }

    /// Reconciliation: replaces everything with the confirmed server
    /// snapshot (`None` meaning clocked out) and persists it.
    pub fn set_session_data(
        &self,
        session: Option<&WorkSession>,
        now: DateTime<Utc>,
    ) -> Result<ClientTimerState> {
        let next = ClientTimerState::from_session(session, now);
        let mut guard = self.write_guard();
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    pub fn reset(&self) -> Result<()> {
        let mut guard = self.write_guard();
        let next = ClientTimerState::default();
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    /// Writes `state.elapsed_ms` into the persisted file without touching
    /// anything else on disk. Skipped when the file describes a different
    /// session or status, which means another writer has confirmed newer
    /// server state since this one last synced.
    fn flush_elapsed(&self, state: &ClientTimerState) -> Result<bool> {
        let Some(path) = &self.inner.path else {
            return Ok(false);
        };

        let mut on_disk = match read_state(path)? {
            Some(on_disk) => on_disk,
            None => state.clone(),
        };
        if on_disk.session_id != state.session_id || on_disk.status != state.status {
            debug!(
                "Not flushing elapsed cache: {} holds {:?} for {:?}",
                path.display(),
                on_disk.status,
                on_disk.session_id
            );
            return Ok(false);
        }

        on_disk.elapsed_ms = state.elapsed_ms;
        write_state(path, &on_disk)?;
        Ok(true)
    }

    /// Updates only the elapsed cache, optionally flushing it to disk.
    pub fn record_elapsed(&self, elapsed_ms: u64, flush: bool) -> Result<()> {
        let mut guard = self.write_guard();
        guard.elapsed_ms = elapsed_ms;
        if flush {
            self.flush_elapsed(&guard)?;
        }
        Ok(())
    }

    /// Recomputes the cache from the formula inputs and flushes it.
    /// Returns the new value, or `None` when the timer is not running.
    pub fn refresh_elapsed(&self, now: DateTime<Utc>) -> Result<Option<u64>> {
        let mut guard = self.write_guard();
        if !guard.is_running() {
            return Ok(None);
        }
        guard.elapsed_ms = guard.elapsed_at(now);
        self.flush_elapsed(&guard)?;
        Ok(Some(guard.elapsed_ms))
    }

    /// Like [`refresh_elapsed`](Self::refresh_elapsed) but re-reads the
    /// persisted file first, for callers that may run without the
    /// foreground process having touched memory.
    pub fn refresh_persisted(&self, now: DateTime<Utc>) -> Result<Option<u64>> {
        {
            let mut guard = self.write_guard();
            if let Some(path) = &self.inner.path {
                if let Some(on_disk) = read_state(path)? {
                    *guard = on_disk;
                }
            }
        }
        self.refresh_elapsed(now)
    }

    /// Replaces memory with the persisted file, if any.
    pub fn reload(&self) -> Result<ClientTimerState> {
        let mut guard = self.write_guard();
        if let Some(path) = &self.inner.path {
            if let Some(on_disk) = read_state(path)? {
                *guard = on_disk;
            }
        }
        Ok(guard.clone())
    }
}
