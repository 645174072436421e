use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::config::ClientSettings;
use crate::db::WorkSession;
use crate::utils::time::format_elapsed;

use super::{
    background::{BackgroundRefresh, PeriodicWake},
    client::{ClientError, ClientResult, SessionApi, StartRequest, StopRequest},
    state::{ClientTimerState, TimerStatus},
    store::TimerStore,
};

const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_error};

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub state: ClientTimerState,
    pub elapsed_ms: u64,
    /// `HH:MM:SS`
    pub display: String,
}

impl TimerSnapshot {
    pub fn at(mut state: ClientTimerState, now: DateTime<Utc>) -> Self {
        let elapsed_ms = state.elapsed_at(now);
        state.elapsed_ms = elapsed_ms;
        Self {
            display: format_elapsed(elapsed_ms),
            elapsed_ms,
            state,
        }
    }
}

/// Coordinates server calls, the local mirror, the foreground ticker and
/// the background wake registration.
///
/// Local state only ever changes from a confirmed server response. A failed
/// call returns the error and leaves the mirror as it was.
#[derive(Clone)]
pub struct TimerController {
    api: Arc<dyn SessionApi>,
    store: TimerStore,
    wake: Arc<dyn PeriodicWake>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Held while the mirror is replaced and while a tick publishes, so a
    /// tick never announces a state that a transition already superseded.
    publish_gate: Arc<Mutex<()>>,
    /// One user action in flight at a time.
    actions: Arc<Mutex<()>>,
    display_tx: Arc<watch::Sender<TimerSnapshot>>,
    foreground: Arc<AtomicBool>,
    tick_interval: Duration,
    persist_every_ticks: u32,
    wake_interval: Duration,
}

impl TimerController {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: TimerStore,
        wake: Arc<dyn PeriodicWake>,
        settings: &ClientSettings,
    ) -> Self {
        let initial = TimerSnapshot::at(store.snapshot(), Utc::now());
        let (display_tx, _) = watch::channel(initial);

        Self {
            api,
            store,
            wake,
            ticker: Arc::new(Mutex::new(None)),
            publish_gate: Arc::new(Mutex::new(())),
            actions: Arc::new(Mutex::new(())),
            display_tx: Arc::new(display_tx),
            foreground: Arc::new(AtomicBool::new(true)),
            tick_interval: settings.tick_interval(),
            persist_every_ticks: settings.effective_persist_every(),
            wake_interval: settings.wake_interval(),
        }
    }

    pub fn store(&self) -> &TimerStore {
        &self.store
    }

    /// Resumes from the persisted mirror straight away, then reconciles
    /// with the server. If the server cannot be reached the persisted state
    /// keeps ticking and the error is returned.
    pub async fn initialize(&self) -> ClientResult<TimerSnapshot> {
        let _action = self.actions.lock().await;

        let persisted = self.store.snapshot();
        {
            let _gate = self.publish_gate.lock().await;
            self.sync_runtime(&persisted).await?;
            self.publish(persisted);
        }

        match self.api.get_active().await {
            Ok(active) => self.apply(active.as_ref()).await,
            Err(err) => {
                warn!("Could not reconcile timer with server: {err}");
                Err(err)
            }
        }
    }

    pub async fn start(&self, request: StartRequest) -> ClientResult<TimerSnapshot> {
        let _action = self.actions.lock().await;
        let session = self.api.start(&request).await.map_err(log_failure("start"))?;
        info!("Clocked in, session {}", session.id);
        self.apply(Some(&session)).await
    }

    pub async fn pause(&self) -> ClientResult<TimerSnapshot> {
        let _action = self.actions.lock().await;
        let session = self.api.pause().await.map_err(log_failure("pause"))?;
        info!("Paused session {}", session.id);
        self.apply(Some(&session)).await
    }

    pub async fn resume(&self) -> ClientResult<TimerSnapshot> {
        let _action = self.actions.lock().await;
        let session = self.api.resume().await.map_err(log_failure("resume"))?;
        info!("Resumed session {}", session.id);
        self.apply(Some(&session)).await
    }

    pub async fn restart(&self) -> ClientResult<TimerSnapshot> {
        let _action = self.actions.lock().await;
        let outcome = self.api.restart().await.map_err(log_failure("restart"))?;
        info!(
            "Restarted: closed {} and opened {}",
            outcome.previous.id, outcome.session.id
        );
        self.apply(Some(&outcome.session)).await
    }

    /// Clocks out the mirrored session and returns the finalized record.
    pub async fn stop(&self, request: StopRequest) -> ClientResult<WorkSession> {
        let _action = self.actions.lock().await;
        let session_id = self
            .store
            .snapshot()
            .session_id
            .ok_or(ClientError::NoActiveSession)?;

        let session = self
            .api
            .stop(&session_id, &request)
            .await
            .map_err(log_failure("stop"))?;
        info!(
            "Clocked out of session {} after {} minute(s)",
            session.id,
            session.duration_minutes.unwrap_or_default()
        );
        self.apply(Some(&session)).await?;
        Ok(session)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot::at(self.store.snapshot(), Utc::now())
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerSnapshot> {
        self.display_tx.subscribe()
    }

    pub async fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Stops the foreground ticker and leaves refreshes to the wake.
    pub async fn enter_background(&self) -> ClientResult<()> {
        self.foreground.store(false, Ordering::SeqCst);
        self.cancel_ticker().await;

        let state = self.store.snapshot();
        if state.is_running() {
            self.store.refresh_elapsed(Utc::now())?;
            self.ensure_wake()?;
        }
        Ok(())
    }

    /// Picks up whatever the wake persisted and restarts the ticker.
    pub async fn enter_foreground(&self) -> ClientResult<TimerSnapshot> {
        self.foreground.store(true, Ordering::SeqCst);

        let _gate = self.publish_gate.lock().await;
        let state = self.store.reload()?;
        self.sync_runtime(&state).await?;
        Ok(self.publish(state))
    }

    /// Tears down the ticker and flushes the cache. A running session keeps
    /// its wake registration.
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.cancel_ticker().await;
        self.store.refresh_elapsed(Utc::now())?;
        Ok(())
    }

    async fn apply(&self, session: Option<&WorkSession>) -> ClientResult<TimerSnapshot> {
        let _gate = self.publish_gate.lock().await;
        let state = self.store.set_session_data(session, Utc::now())?;
        self.sync_runtime(&state).await?;
        Ok(self.publish(state))
    }

    /// Caller holds the publish gate.
    async fn sync_runtime(&self, state: &ClientTimerState) -> ClientResult<()> {
        match state.status {
            TimerStatus::Running => {
                if self.is_foreground() {
                    self.spawn_ticker().await;
                }
                self.ensure_wake()?;
            }
            TimerStatus::Paused => {
                self.cancel_ticker().await;
                self.ensure_wake()?;
            }
            TimerStatus::Idle => {
                self.cancel_ticker().await;
                self.wake.unregister()?;
            }
        }
        Ok(())
    }

    fn ensure_wake(&self) -> ClientResult<()> {
        if !self.wake.is_registered() {
            let callback = BackgroundRefresh::new(self.store.clone()).into_callback();
            self.wake.register(self.wake_interval, callback)?;
        }
        Ok(())
    }

    fn publish(&self, state: ClientTimerState) -> TimerSnapshot {
        let snapshot = TimerSnapshot::at(state, Utc::now());
        self.display_tx.send_replace(snapshot.clone());
        snapshot
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let store = self.store.clone();
        let gate = self.publish_gate.clone();
        let display_tx = self.display_tx.clone();
        let tick_interval = self.tick_interval;
        let persist_every = self.persist_every_ticks.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick_interval, tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;

                let _gate = gate.lock().await;
                let state = store.snapshot();
                if !state.is_running() {
                    break;
                }

                ticks = ticks.wrapping_add(1);
                let snapshot = TimerSnapshot::at(state, Utc::now());
                let flush = ticks % persist_every == 0;
                if let Err(err) = store.record_elapsed(snapshot.elapsed_ms, flush) {
                    log_error!("Failed to persist elapsed cache: {err:#}");
                }
                log_debug!("tick {ticks}: {}", snapshot.display);
                display_tx.send_replace(snapshot);
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}

fn log_failure(action: &'static str) -> impl Fn(ClientError) -> ClientError {
    move |err| {
        warn!("Timer {action} failed, keeping local state: {err}");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewWorkSession, RestartOutcome, SessionError, StopFields};
    use crate::timer::background::ManualWake;
    use crate::utils::time::elapsed_between;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    const USER: &str = "user-1";

    struct FakeApi {
        db: Database,
        fail: AtomicBool,
    }

    impl FakeApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                db: Database::in_memory().expect("in-memory DB"),
                fail: AtomicBool::new(false),
            })
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn check(&self) -> ClientResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Rejected {
                    status: 503,
                    message: "offline".into(),
                });
            }
            Ok(())
        }
    }

    fn map_err(err: SessionError) -> ClientError {
        match err {
            SessionError::NotFound => ClientError::NotFound(err.to_string()),
            SessionError::AlreadyActive | SessionError::InvalidState(_) => {
                ClientError::InvalidState(err.to_string())
            }
            other => ClientError::Rejected {
                status: 500,
                message: other.to_string(),
            },
        }
    }

    #[async_trait]
    impl SessionApi for FakeApi {
        async fn get_active(&self) -> ClientResult<Option<WorkSession>> {
            self.check()?;
            self.db.get_active_session(USER).await.map_err(map_err)
        }

        async fn start(&self, request: &StartRequest) -> ClientResult<WorkSession> {
            self.check()?;
            let new = NewWorkSession {
                start_time: None,
                description: request.description.clone(),
                location: request.location.clone(),
                hourly_rate: request.hourly_rate,
            };
            self.db
                .create_session(USER, new, Utc::now())
                .await
                .map_err(map_err)
        }

        async fn pause(&self) -> ClientResult<WorkSession> {
            self.check()?;
            self.db.pause_session(USER, Utc::now()).await.map_err(map_err)
        }

        async fn resume(&self) -> ClientResult<WorkSession> {
            self.check()?;
            self.db.resume_session(USER, Utc::now()).await.map_err(map_err)
        }

        async fn restart(&self) -> ClientResult<RestartOutcome> {
            self.check()?;
            self.db.restart_session(USER, Utc::now()).await.map_err(map_err)
        }

        async fn stop(&self, session_id: &str, request: &StopRequest) -> ClientResult<WorkSession> {
            self.check()?;
            let fields = StopFields {
                duration_minutes: request.duration_minutes,
                update: request.update.clone(),
            };
            self.db
                .stop_session(USER, session_id, fields, Utc::now())
                .await
                .map_err(map_err)
        }
    }

    fn fast_settings() -> ClientSettings {
        ClientSettings {
            tick_interval_ms: 10,
            persist_every_ticks: 1,
            ..ClientSettings::default()
        }
    }

    fn build(api: Arc<FakeApi>, store: TimerStore) -> (TimerController, Arc<ManualWake>) {
        let wake = Arc::new(ManualWake::new());
        let controller = TimerController::new(api, store, wake.clone(), &fast_settings());
        (controller, wake)
    }

    #[tokio::test]
    async fn lifecycle_follows_server_responses() {
        let api = FakeApi::new();
        let (controller, wake) = build(api.clone(), TimerStore::in_memory());

        let started = controller.start(StartRequest::default()).await.unwrap();
        assert_eq!(started.state.status, TimerStatus::Running);
        assert!(controller.is_ticking().await);
        assert!(wake.is_registered());
        assert_eq!(wake.interval(), Some(Duration::from_secs(60)));

        let paused = controller.pause().await.unwrap();
        assert_eq!(paused.state.status, TimerStatus::Paused);
        assert!(!controller.is_ticking().await);
        assert!(wake.is_registered());

        let resumed = controller.resume().await.unwrap();
        assert_eq!(resumed.state.status, TimerStatus::Running);
        assert!(controller.is_ticking().await);

        let finished = controller.stop(StopRequest::default()).await.unwrap();
        assert!(!finished.is_active);
        assert_eq!(finished.duration_minutes, Some(0));
        assert!(controller.snapshot().state.is_idle());
        assert!(!controller.is_ticking().await);
        assert!(!wake.is_registered());
    }

    #[tokio::test]
    async fn failed_call_keeps_last_confirmed_state() {
        let api = FakeApi::new();
        let (controller, _wake) = build(api.clone(), TimerStore::in_memory());

        let started = controller.start(StartRequest::default()).await.unwrap();
        api.set_failing(true);

        let err = controller.pause().await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 503, .. }));

        let state = controller.snapshot().state;
        assert_eq!(state.status, TimerStatus::Running);
        assert_eq!(state.session_id, started.state.session_id);
        assert!(controller.is_ticking().await);
    }

    #[tokio::test]
    async fn rejected_transition_surfaces_and_keeps_state() {
        let api = FakeApi::new();
        let (controller, _wake) = build(api, TimerStore::in_memory());

        controller.start(StartRequest::default()).await.unwrap();
        let err = controller.resume().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
        assert_eq!(controller.snapshot().state.status, TimerStatus::Running);
    }

    #[tokio::test]
    async fn stop_without_session_is_refused_locally() {
        let api = FakeApi::new();
        let (controller, _wake) = build(api, TimerStore::in_memory());
        let err = controller.stop(StopRequest::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::NoActiveSession));
    }

    #[tokio::test]
    async fn initialize_adopts_server_state() {
        let api = FakeApi::new();
        api.db
            .create_session(USER, NewWorkSession::default(), Utc::now() - ChronoDuration::minutes(3))
            .await
            .unwrap();
        api.db.pause_session(USER, Utc::now()).await.unwrap();

        let (controller, wake) = build(api, TimerStore::in_memory());
        let snapshot = controller.initialize().await.unwrap();

        assert_eq!(snapshot.state.status, TimerStatus::Paused);
        assert_eq!(snapshot.elapsed_ms / 60_000, 3);
        assert!(!controller.is_ticking().await);
        // Registered while a session exists, however Paused was reached.
        assert!(wake.is_registered());
    }

    #[tokio::test]
    async fn initialize_offline_keeps_ticking_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timer.json");

        let api = FakeApi::new();
        let session = api
            .db
            .create_session(USER, NewWorkSession::default(), Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();
        TimerStore::open(path.clone())
            .unwrap()
            .set_session_data(Some(&session), Utc::now())
            .unwrap();

        api.set_failing(true);
        let (controller, wake) = build(api, TimerStore::open(path).unwrap());
        assert!(controller.initialize().await.is_err());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state.status, TimerStatus::Running);
        assert_eq!(snapshot.state.session_id.as_deref(), Some(session.id.as_str()));
        assert!(snapshot.elapsed_ms >= 5 * 60_000);
        assert!(controller.is_ticking().await);
        assert!(wake.is_registered());
    }

    #[tokio::test]
    async fn ticker_publishes_recomputed_elapsed() {
        let api = FakeApi::new();
        let (controller, _wake) = build(api, TimerStore::in_memory());
        let mut rx = controller.subscribe();

        controller.start(StartRequest::default()).await.unwrap();
        let mut last = 0;
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), rx.changed())
                .await
                .expect("ticker stalled")
                .unwrap();
            let current = rx.borrow_and_update().clone();
            assert_eq!(current.state.status, TimerStatus::Running);
            assert!(current.elapsed_ms >= last);
            last = current.elapsed_ms;
        }
        assert_eq!(controller.store().snapshot().status, TimerStatus::Running);
    }

    #[tokio::test]
    async fn background_hands_over_to_wake() {
        let api = FakeApi::new();
        let (controller, wake) = build(api, TimerStore::in_memory());

        controller.start(StartRequest::default()).await.unwrap();
        controller.enter_background().await.unwrap();
        assert!(!controller.is_foreground());
        assert!(!controller.is_ticking().await);
        assert!(wake.fire());

        let snapshot = controller.enter_foreground().await.unwrap();
        assert_eq!(snapshot.state.status, TimerStatus::Running);
        assert!(controller.is_ticking().await);
    }

    #[tokio::test]
    async fn wake_only_interval_matches_continuous_ticking() {
        let api = FakeApi::new();
        let start = Utc::now() - ChronoDuration::minutes(7);
        api.db
            .create_session(USER, NewWorkSession::default(), start)
            .await
            .unwrap();
        api.db.pause_session(USER, start + ChronoDuration::minutes(1)).await.unwrap();
        api.db.resume_session(USER, start + ChronoDuration::minutes(2)).await.unwrap();

        let (controller, wake) = build(api, TimerStore::in_memory());
        let mut rx = controller.subscribe();
        controller.initialize().await.unwrap();
        controller.enter_background().await.unwrap();

        assert!(wake.fire());
        let woken = controller.store().snapshot();
        let expected = elapsed_between(start, Utc::now(), 60_000);
        assert!(expected.abs_diff(woken.elapsed_ms) <= 1_000);

        let snapshot = controller.enter_foreground().await.unwrap();
        let expected = elapsed_between(start, Utc::now(), 60_000);
        assert!(
            expected.abs_diff(snapshot.elapsed_ms) <= 1_000,
            "{} vs {expected}",
            snapshot.elapsed_ms
        );
        assert_eq!(snapshot.elapsed_ms / 60_000, 6);

        let published = rx.borrow_and_update().clone();
        assert_eq!(published.state.status, TimerStatus::Running);
        assert!(expected.abs_diff(published.elapsed_ms) <= 1_000);
    }

    #[tokio::test]
    async fn restart_swaps_in_the_new_session() {
        let api = FakeApi::new();
        let (controller, _wake) = build(api.clone(), TimerStore::in_memory());

        let first = controller.start(StartRequest::default()).await.unwrap();
        controller.pause().await.unwrap();
        let restarted = controller.restart().await.unwrap();

        assert_eq!(restarted.state.status, TimerStatus::Running);
        assert_eq!(restarted.state.accumulated_ms, 0);
        assert_ne!(restarted.state.session_id, first.state.session_id);
        assert!(controller.is_ticking().await);

        let closed = api
            .db
            .get_session(USER, first.state.session_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(!closed.is_active);
    }
}
