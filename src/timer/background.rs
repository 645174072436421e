//! Periodic wake while the app is not in the foreground.
//!
//! The OS decides when (and whether) a background refresh runs, so the
//! interval handed to [`PeriodicWake::register`] is advisory. A wake never
//! touches the network: it re-reads the persisted mirror, recomputes the
//! elapsed cache from the formula inputs and writes only that cache back.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{state::TimerStatus, store::TimerStore};

// Wakes are frequent and uneventful; keep them quiet unless debugging.
const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_error, log_info};

/// Identifier platform schedulers register the refresh under.
pub const WAKE_TASK_ID: &str = "shiftclock.timer-refresh";

pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// Port over the platform's periodic background scheduler.
pub trait PeriodicWake: Send + Sync {
    /// Registers `callback`, replacing any previous registration.
    fn register(&self, interval: Duration, callback: WakeCallback) -> Result<()>;
    /// No-op when nothing is registered.
    fn unregister(&self) -> Result<()>;
    fn is_registered(&self) -> bool;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Wake that only fires when told to. Used in tests and anywhere the host
/// drives refreshes itself.
#[derive(Default)]
pub struct ManualWake {
    slot: Mutex<Option<(Duration, WakeCallback)>>,
}

impl ManualWake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the registered callback once. Returns false when unregistered.
    pub fn fire(&self) -> bool {
        let callback = lock(&self.slot).as_ref().map(|(_, cb)| cb.clone());
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        lock(&self.slot).as_ref().map(|(interval, _)| *interval)
    }
}

impl PeriodicWake for ManualWake {
    fn register(&self, interval: Duration, callback: WakeCallback) -> Result<()> {
        *lock(&self.slot) = Some((interval, callback));
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        lock(&self.slot).take();
        Ok(())
    }

    fn is_registered(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

struct IntervalTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// In-process adapter: a tokio interval standing in for the OS scheduler
/// on platforms without one (desktop, CLI).
#[derive(Default)]
pub struct IntervalWake {
    task: Mutex<Option<IntervalTask>>,
}

impl IntervalWake {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeriodicWake for IntervalWake {
    fn register(&self, interval: Duration, callback: WakeCallback) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| anyhow!("interval wake needs a tokio runtime: {err}"))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => callback(),
                    _ = token.cancelled() => break,
                }
            }
        });

        let previous = lock(&self.task).replace(IntervalTask { handle, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.handle.abort();
        }
        log_info!("registered {WAKE_TASK_ID} every {}s", interval.as_secs());
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        if let Some(task) = lock(&self.task).take() {
            task.cancel.cancel();
            task.handle.abort();
            log_info!("unregistered {WAKE_TASK_ID}");
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    Refreshed(u64),
    Skipped(TimerStatus),
}

/// What a wake actually does.
#[derive(Clone)]
pub struct BackgroundRefresh {
    store: TimerStore,
}

impl BackgroundRefresh {
    pub fn new(store: TimerStore) -> Self {
        Self { store }
    }

    pub fn on_wake(&self, now: DateTime<Utc>) -> Result<WakeOutcome> {
        match self.store.refresh_persisted(now)? {
            Some(elapsed_ms) => {
                log_debug!("background wake refreshed elapsed to {elapsed_ms}ms");
                Ok(WakeOutcome::Refreshed(elapsed_ms))
            }
            None => Ok(WakeOutcome::Skipped(self.store.snapshot().status)),
        }
    }

    pub fn into_callback(self) -> WakeCallback {
        Arc::new(move || {
            if let Err(err) = self.on_wake(Utc::now()) {
                log_error!("background wake failed: {err:#}");
            }
        })
    }
}
