use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    error::SessionError,
    helpers::{
        parse_datetime, parse_evidence, parse_optional_datetime, to_i64, to_sql_datetime, to_u64,
    },
    models::{NewWorkSession, SessionUpdate, StopFields, WorkSession},
    Database,
};
use crate::utils::time::{elapsed_between, pause_duration_ms, whole_minutes};

const SESSION_COLUMNS: &str = "id, user_id, start_time, end_time, is_active, is_paused, paused_at, \
     total_paused_ms, duration_minutes, description, location, hourly_rate, evidence, \
     created_at, updated_at";

pub const MAX_PAGE_SIZE: usize = 200;

/// Result of a restart: the session that was closed and its replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartOutcome {
    pub previous: WorkSession,
    pub session: WorkSession,
}

fn row_to_session(row: &Row) -> Result<WorkSession> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let paused_at: Option<String> = row.get("paused_at")?;
    let total_paused_ms: i64 = row.get("total_paused_ms")?;
    let evidence: String = row.get("evidence")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(WorkSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        is_active: row.get("is_active")?,
        is_paused: row.get("is_paused")?,
        paused_at: parse_optional_datetime(paused_at, "paused_at")?,
        total_paused_ms: to_u64(total_paused_ms, "total_paused_ms")?,
        duration_minutes: row.get("duration_minutes")?,
        description: row.get("description")?,
        location: row.get("location")?,
        hourly_rate: row.get("hourly_rate")?,
        evidence: parse_evidence(&evidence)?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn load_active(conn: &Connection, user_id: &str) -> Result<Option<WorkSession>, SessionError> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM work_sessions WHERE user_id = ?1 AND is_active = 1 LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

fn load_by_id(
    conn: &Connection,
    user_id: &str,
    session_id: &str,
) -> Result<Option<WorkSession>, SessionError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM work_sessions WHERE id = ?1 AND user_id = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![session_id, user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

fn insert(conn: &Connection, session: &WorkSession) -> Result<(), SessionError> {
    conn.execute(
        "INSERT INTO work_sessions (id, user_id, start_time, end_time, is_active, is_paused, paused_at,
             total_paused_ms, duration_minutes, description, location, hourly_rate, evidence,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            session.id,
            session.user_id,
            to_sql_datetime(&session.start_time),
            session.end_time.as_ref().map(to_sql_datetime),
            session.is_active,
            session.is_paused,
            session.paused_at.as_ref().map(to_sql_datetime),
            to_i64(session.total_paused_ms)?,
            session.duration_minutes,
            session.description,
            session.location,
            session.hourly_rate,
            serde_json::to_string(&session.evidence)?,
            to_sql_datetime(&session.created_at),
            to_sql_datetime(&session.updated_at),
        ],
    )?;
    Ok(())
}

/// Writes every mutable column back. `start_time`, `user_id` and
/// `created_at` are never touched after insert.
fn write_back(conn: &Connection, session: &WorkSession) -> Result<(), SessionError> {
    let updated = conn.execute(
        "UPDATE work_sessions
         SET end_time = ?1,
             is_active = ?2,
             is_paused = ?3,
             paused_at = ?4,
             total_paused_ms = ?5,
             duration_minutes = ?6,
             description = ?7,
             location = ?8,
             hourly_rate = ?9,
             evidence = ?10,
             updated_at = ?11
         WHERE id = ?12 AND user_id = ?13",
        params![
            session.end_time.as_ref().map(to_sql_datetime),
            session.is_active,
            session.is_paused,
            session.paused_at.as_ref().map(to_sql_datetime),
            to_i64(session.total_paused_ms)?,
            session.duration_minutes,
            session.description,
            session.location,
            session.hourly_rate,
            serde_json::to_string(&session.evidence)?,
            to_sql_datetime(&session.updated_at),
            session.id,
            session.user_id,
        ],
    )?;

    if updated == 0 {
        return Err(SessionError::NotFound);
    }
    Ok(())
}

fn validate_rate(rate: Option<f64>) -> Result<(), SessionError> {
    match rate {
        Some(value) if !value.is_finite() || value < 0.0 => Err(SessionError::Validation(
            format!("hourlyRate must be a non-negative number, got {value}"),
        )),
        _ => Ok(()),
    }
}

fn apply_update(session: &mut WorkSession, update: SessionUpdate) -> Result<(), SessionError> {
    if update.is_empty() {
        return Ok(());
    }
    validate_rate(update.hourly_rate)?;

    if let Some(description) = update.description {
        session.description = Some(description);
    }
    if let Some(location) = update.location {
        session.location = Some(location);
    }
    if let Some(rate) = update.hourly_rate {
        session.hourly_rate = Some(rate);
    }
    if let Some(evidence) = update.evidence {
        session.evidence = evidence;
    }
    Ok(())
}

fn begin_pause(session: &mut WorkSession, now: DateTime<Utc>) -> Result<(), SessionError> {
    if session.is_paused {
        return Err(SessionError::InvalidState(
            "session is already paused".into(),
        ));
    }
    session.is_paused = true;
    session.paused_at = Some(now);
    session.updated_at = now;
    Ok(())
}

/// Adds an open pause to the ledger and clears it. No-op when not paused.
fn fold_open_pause(session: &mut WorkSession, now: DateTime<Utc>) {
    if let Some(paused_at) = session.paused_at.take() {
        session.total_paused_ms = session
            .total_paused_ms
            .saturating_add(pause_duration_ms(paused_at, now));
    }
    session.is_paused = false;
}

fn end_pause(session: &mut WorkSession, now: DateTime<Utc>) -> Result<(), SessionError> {
    if !session.is_paused || session.paused_at.is_none() {
        return Err(SessionError::InvalidState(
            "session is not paused".into(),
        ));
    }

    fold_open_pause(session, now);
    session.updated_at = now;
    Ok(())
}

/// Closes the session at `now`. An open pause is folded into the ledger
/// first so it never counts as worked time.
fn finalize(session: &mut WorkSession, now: DateTime<Utc>, duration_override: Option<i64>) {
    fold_open_pause(session, now);

    let worked_ms = elapsed_between(session.start_time, now, session.total_paused_ms);
    session.end_time = Some(now);
    session.is_active = false;
    session.duration_minutes = Some(duration_override.unwrap_or_else(|| whole_minutes(worked_ms)));
    session.updated_at = now;
}

fn fresh_session(user_id: &str, new: NewWorkSession, now: DateTime<Utc>) -> WorkSession {
    WorkSession {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        start_time: new.start_time.unwrap_or(now),
        end_time: None,
        is_active: true,
        is_paused: false,
        paused_at: None,
        total_paused_ms: 0,
        duration_minutes: None,
        description: new.description,
        location: new.location,
        hourly_rate: new.hourly_rate,
        evidence: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

/// Runs `mutate` on the caller's active session inside one write
/// transaction and persists the result.
fn mutate_active<F>(
    conn: &mut Connection,
    user_id: &str,
    mutate: F,
) -> Result<WorkSession, SessionError>
where
    F: FnOnce(&mut WorkSession) -> Result<(), SessionError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut session = load_active(&tx, user_id)?.ok_or(SessionError::NotFound)?;
    mutate(&mut session)?;
    write_back(&tx, &session)?;
    tx.commit()?;
    Ok(session)
}

fn log_outcome(action: &str, user_id: &str, result: &Result<WorkSession, SessionError>) {
    match result {
        Ok(session) => info!("{action} work session {} for user {user_id}", session.id),
        Err(SessionError::Storage(err)) => {
            log::error!("{action} failed for user {user_id}: {err:#}")
        }
        Err(err) => warn!("{action} rejected for user {user_id}: {err}"),
    }
}

impl Database {
    pub async fn get_active_session(&self, user_id: &str) -> Result<Option<WorkSession>, SessionError> {
        let user_id = user_id.to_string();
        self.execute(move |conn| load_active(conn, &user_id)).await
    }

    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<WorkSession, SessionError> {
        let user_id = user_id.to_string();
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            load_by_id(conn, &user_id, &session_id)?.ok_or(SessionError::NotFound)
        })
        .await
    }

    /// Clocks in. Rejected with `AlreadyActive` when the user already has
    /// an active session; the partial unique index backs the check.
    pub async fn create_session(
        &self,
        user_id: &str,
        new: NewWorkSession,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        validate_rate(new.hourly_rate)?;

        let owner = user_id.to_string();
        let result = self
            .execute(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if load_active(&tx, &owner)?.is_some() {
                    return Err(SessionError::AlreadyActive);
                }
                let session = fresh_session(&owner, new, now);
                insert(&tx, &session)?;
                tx.commit()?;
                Ok(session)
            })
            .await;

        log_outcome("Started", user_id, &result);
        result
    }

    pub async fn pause_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        let owner = user_id.to_string();
        let result = self
            .execute(move |conn| mutate_active(conn, &owner, |session| begin_pause(session, now)))
            .await;

        log_outcome("Paused", user_id, &result);
        result
    }

    pub async fn resume_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        let owner = user_id.to_string();
        let result = self
            .execute(move |conn| mutate_active(conn, &owner, |session| end_pause(session, now)))
            .await;

        log_outcome("Resumed", user_id, &result);
        result
    }

    /// Stops the active session and opens a fresh one at `now` in a single
    /// transaction. Descriptive fields other than evidence carry over.
    pub async fn restart_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RestartOutcome, SessionError> {
        let owner = user_id.to_string();
        let result = self
            .execute(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut previous = load_active(&tx, &owner)?.ok_or(SessionError::NotFound)?;

                finalize(&mut previous, now, None);
                write_back(&tx, &previous)?;

                let carried = NewWorkSession {
                    start_time: Some(now),
                    description: previous.description.clone(),
                    location: previous.location.clone(),
                    hourly_rate: previous.hourly_rate,
                };
                let session = fresh_session(&owner, carried, now);
                insert(&tx, &session)?;

                tx.commit()?;
                Ok(RestartOutcome { previous, session })
            })
            .await;

        match &result {
            Ok(outcome) => info!(
                "Restarted work session {} -> {} for user {user_id} ({} min recorded)",
                outcome.previous.id,
                outcome.session.id,
                outcome.previous.duration_minutes.unwrap_or_default()
            ),
            Err(err) => warn!("Restart rejected for user {user_id}: {err}"),
        }
        result
    }

    /// Clocks out `session_id`, which must be the caller's active session.
    pub async fn stop_session(
        &self,
        user_id: &str,
        session_id: &str,
        fields: StopFields,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        if let Some(minutes) = fields.duration_minutes {
            if minutes < 0 {
                return Err(SessionError::Validation(format!(
                    "durationMinutes must not be negative, got {minutes}"
                )));
            }
        }

        let owner = user_id.to_string();
        let target = session_id.to_string();
        let result = self
            .execute(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut session = load_by_id(&tx, &owner, &target)?.ok_or(SessionError::NotFound)?;
                if !session.is_active {
                    return Err(SessionError::InvalidState(
                        "session has already been stopped".into(),
                    ));
                }

                apply_update(&mut session, fields.update)?;
                finalize(&mut session, now, fields.duration_minutes);
                write_back(&tx, &session)?;
                tx.commit()?;
                Ok(session)
            })
            .await;

        log_outcome("Stopped", user_id, &result);
        result
    }

    /// Edits descriptive fields. `duration_minutes` may only be corrected on
    /// a session that has already been stopped.
    pub async fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        update: SessionUpdate,
        duration_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        let owner = user_id.to_string();
        let target = session_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut session = load_by_id(&tx, &owner, &target)?.ok_or(SessionError::NotFound)?;

            if let Some(minutes) = duration_minutes {
                if session.is_active {
                    return Err(SessionError::InvalidState(
                        "duration of an active session is computed when it stops".into(),
                    ));
                }
                if minutes < 0 {
                    return Err(SessionError::Validation(format!(
                        "durationMinutes must not be negative, got {minutes}"
                    )));
                }
                session.duration_minutes = Some(minutes);
            }

            apply_update(&mut session, update)?;
            session.updated_at = now;
            write_back(&tx, &session)?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    /// Most recent first, active session included.
    pub async fn list_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkSession>, SessionError> {
        let user_id = user_id.to_string();
        let limit = limit.min(MAX_PAGE_SIZE) as i64;
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM work_sessions
                 WHERE user_id = ?1
                 ORDER BY start_time DESC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![user_id, limit, offset])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Removes a stopped session. Active sessions must be stopped first.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), SessionError> {
        let owner = user_id.to_string();
        let target = session_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let session = load_by_id(&tx, &owner, &target)?.ok_or(SessionError::NotFound)?;
            if session.is_active {
                return Err(SessionError::InvalidState(
                    "stop the session before deleting it".into(),
                ));
            }
            tx.execute(
                "DELETE FROM work_sessions WHERE id = ?1 AND user_id = ?2",
                params![target, owner],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::parse_timestamp_strict;

    const USER: &str = "user-1";

    fn at(value: &str) -> DateTime<Utc> {
        parse_timestamp_strict(value).unwrap()
    }

    fn db() -> Database {
        Database::in_memory().unwrap()
    }

    async fn start_at(db: &Database, value: &str) -> WorkSession {
        db.create_session(USER, NewWorkSession::default(), at(value))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pause_resume_scenario_yields_eight_minutes() {
        let db = db();
        let started = start_at(&db, "2024-03-01T10:00:00Z").await;
        assert!(started.is_active);
        assert_eq!(started.start_time, at("2024-03-01T10:00:00Z"));

        let paused = db.pause_session(USER, at("2024-03-01T10:05:00Z")).await.unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.paused_at, Some(at("2024-03-01T10:05:00Z")));
        assert_eq!(paused.total_paused_ms, 0);

        let resumed = db.resume_session(USER, at("2024-03-01T10:07:00Z")).await.unwrap();
        assert!(!resumed.is_paused);
        assert_eq!(resumed.paused_at, None);
        assert_eq!(resumed.total_paused_ms, 120_000);
        assert_eq!(resumed.elapsed_ms(at("2024-03-01T10:10:00Z")), 8 * 60_000);

        let stopped = db
            .stop_session(USER, &started.id, StopFields::default(), at("2024-03-01T10:10:00Z"))
            .await
            .unwrap();
        assert!(!stopped.is_active);
        assert_eq!(stopped.end_time, Some(at("2024-03-01T10:10:00Z")));
        assert_eq!(stopped.duration_minutes, Some(8));
        assert!(db.get_active_session(USER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_create_conflicts() {
        let db = db();
        let first = start_at(&db, "2024-03-01T10:00:00Z").await;

        let err = db
            .create_session(USER, NewWorkSession::default(), at("2024-03-01T10:01:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));

        let sessions = db.list_sessions(USER, 10, 0).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, first.id);
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one() {
        let db = db();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.create_session(USER, NewWorkSession::default(), Utc::now()).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(err) => assert!(matches!(err, SessionError::AlreadyActive)),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn unique_index_backs_the_invariant() {
        let db = db();
        let existing = start_at(&db, "2024-03-01T10:00:00Z").await;

        let mut duplicate = existing.clone();
        duplicate.id = Uuid::new_v4().to_string();
        let err = db
            .execute(move |conn| insert(conn, &duplicate))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
    }

    #[tokio::test]
    async fn invalid_transitions_leave_record_untouched() {
        let db = db();
        start_at(&db, "2024-03-01T10:00:00Z").await;

        let running = db.get_active_session(USER).await.unwrap().unwrap();
        let err = db.resume_session(USER, at("2024-03-01T10:02:00Z")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(db.get_active_session(USER).await.unwrap().unwrap(), running);

        let paused = db.pause_session(USER, at("2024-03-01T10:03:00Z")).await.unwrap();
        let err = db.pause_session(USER, at("2024-03-01T10:04:00Z")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(db.get_active_session(USER).await.unwrap().unwrap(), paused);
    }

    #[tokio::test]
    async fn operations_without_active_session_are_not_found() {
        let db = db();
        let now = at("2024-03-01T10:00:00Z");
        assert!(matches!(
            db.pause_session(USER, now).await.unwrap_err(),
            SessionError::NotFound
        ));
        assert!(matches!(
            db.resume_session(USER, now).await.unwrap_err(),
            SessionError::NotFound
        ));
        assert!(matches!(
            db.restart_session(USER, now).await.unwrap_err(),
            SessionError::NotFound
        ));
        assert!(matches!(
            db.stop_session(USER, "missing", StopFields::default(), now)
                .await
                .unwrap_err(),
            SessionError::NotFound
        ));
    }

    #[tokio::test]
    async fn restart_closes_old_and_opens_fresh() {
        let db = db();
        let original = db
            .create_session(
                USER,
                NewWorkSession {
                    description: Some("clinic".into()),
                    hourly_rate: Some(40.0),
                    ..NewWorkSession::default()
                },
                at("2024-03-01T09:00:00Z"),
            )
            .await
            .unwrap();
        db.pause_session(USER, at("2024-03-01T09:20:00Z")).await.unwrap();
        db.resume_session(USER, at("2024-03-01T09:30:00Z")).await.unwrap();

        let outcome = db.restart_session(USER, at("2024-03-01T10:00:00Z")).await.unwrap();

        assert_eq!(outcome.previous.id, original.id);
        assert!(!outcome.previous.is_active);
        assert_eq!(outcome.previous.end_time, Some(at("2024-03-01T10:00:00Z")));
        assert_eq!(outcome.previous.duration_minutes, Some(50));

        assert_ne!(outcome.session.id, original.id);
        assert!(outcome.session.is_active);
        assert_eq!(outcome.session.start_time, at("2024-03-01T10:00:00Z"));
        assert_eq!(outcome.session.total_paused_ms, 0);
        assert_eq!(outcome.session.description.as_deref(), Some("clinic"));

        let active = db.get_active_session(USER).await.unwrap().unwrap();
        assert_eq!(active.id, outcome.session.id);
    }

    #[tokio::test]
    async fn stopping_while_paused_excludes_open_pause() {
        let db = db();
        let session = start_at(&db, "2024-03-01T10:00:00Z").await;
        db.pause_session(USER, at("2024-03-01T10:30:00Z")).await.unwrap();

        let stopped = db
            .stop_session(USER, &session.id, StopFields::default(), at("2024-03-01T11:00:00Z"))
            .await
            .unwrap();
        assert!(!stopped.is_paused);
        assert_eq!(stopped.paused_at, None);
        assert_eq!(stopped.total_paused_ms, 30 * 60_000);
        assert_eq!(stopped.duration_minutes, Some(30));
    }

    #[test]
    fn folding_and_empty_updates_leave_running_sessions_alone() {
        let start = at("2024-03-01T10:00:00Z");
        let mut session = fresh_session(
            USER,
            NewWorkSession {
                description: Some("clinic".into()),
                ..NewWorkSession::default()
            },
            start,
        );

        fold_open_pause(&mut session, at("2024-03-01T10:20:00Z"));
        assert_eq!(session.total_paused_ms, 0);
        assert!(!session.is_paused);

        apply_update(&mut session, SessionUpdate::default()).unwrap();
        assert_eq!(session.description.as_deref(), Some("clinic"));

        begin_pause(&mut session, at("2024-03-01T10:05:00Z")).unwrap();
        fold_open_pause(&mut session, at("2024-03-01T10:07:00Z"));
        assert_eq!(session.total_paused_ms, 2 * 60_000);
        assert_eq!(session.paused_at, None);
        assert!(matches!(
            end_pause(&mut session, at("2024-03-01T10:08:00Z")),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn stop_applies_override_and_fields() {
        let db = db();
        let session = start_at(&db, "2024-03-01T10:00:00Z").await;
        let fields = StopFields {
            duration_minutes: Some(45),
            update: SessionUpdate {
                location: Some("Ward 7".into()),
                evidence: Some(vec!["doc-42".into()]),
                ..SessionUpdate::default()
            },
        };

        let stopped = db
            .stop_session(USER, &session.id, fields, at("2024-03-01T10:10:00Z"))
            .await
            .unwrap();
        assert_eq!(stopped.duration_minutes, Some(45));
        assert_eq!(stopped.location.as_deref(), Some("Ward 7"));
        assert_eq!(stopped.evidence, vec!["doc-42".to_string()]);

        let again = db
            .stop_session(USER, &session.id, StopFields::default(), at("2024-03-01T10:11:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(again, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn sessions_are_scoped_per_user() {
        let db = db();
        let mine = start_at(&db, "2024-03-01T10:00:00Z").await;
        let theirs = db
            .create_session("user-2", NewWorkSession::default(), at("2024-03-01T10:00:00Z"))
            .await
            .unwrap();
        assert_ne!(mine.id, theirs.id);

        let err = db
            .stop_session("user-2", &mine.id, StopFields::default(), at("2024-03-01T10:05:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
        assert!(matches!(
            db.get_session("user-2", &mine.id).await.unwrap_err(),
            SessionError::NotFound
        ));
    }

    #[tokio::test]
    async fn update_guards_duration_and_rate() {
        let db = db();
        let session = start_at(&db, "2024-03-01T10:00:00Z").await;
        let now = at("2024-03-01T10:05:00Z");

        let err = db
            .update_session(USER, &session.id, SessionUpdate::default(), Some(10), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));

        let bad_rate = SessionUpdate {
            hourly_rate: Some(-1.0),
            ..SessionUpdate::default()
        };
        let err = db
            .update_session(USER, &session.id, bad_rate, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let described = SessionUpdate {
            description: Some("theatre list".into()),
            ..SessionUpdate::default()
        };
        let updated = db
            .update_session(USER, &session.id, described, None, now)
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("theatre list"));
        assert!(updated.is_active);
        assert_eq!(updated.start_time, session.start_time);
    }

    #[tokio::test]
    async fn list_and_delete_history() {
        let db = db();
        let first = start_at(&db, "2024-03-01T08:00:00Z").await;
        db.stop_session(USER, &first.id, StopFields::default(), at("2024-03-01T09:00:00Z"))
            .await
            .unwrap();
        let second = start_at(&db, "2024-03-01T10:00:00Z").await;

        let listed = db.list_sessions(USER, 10, 0).await.unwrap();
        assert_eq!(
            listed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec![second.id.as_str(), first.id.as_str()]
        );
        assert_eq!(db.list_sessions(USER, 1, 1).await.unwrap()[0].id, first.id);

        let err = db.delete_session(USER, &second.id).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));

        db.delete_session(USER, &first.id).await.unwrap();
        assert!(matches!(
            db.get_session(USER, &first.id).await.unwrap_err(),
            SessionError::NotFound
        ));
    }
}
