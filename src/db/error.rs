use thiserror::Error;

/// Failures of work-session operations. Every variant except `Storage` is
/// raised before anything is written, and `Storage` aborts the surrounding
/// transaction, so a failed operation never leaves a partial mutation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no matching work session")]
    NotFound,

    #[error("an active work session already exists")]
    AlreadyActive,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable machine-readable kind used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotFound => "not_found",
            SessionError::AlreadyActive => "already_active",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::Validation(_) => "validation",
            SessionError::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        if is_unique_violation(&err) {
            return SessionError::AlreadyActive;
        }
        SessionError::Storage(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Storage(anyhow::Error::new(err).context("failed to encode evidence list"))
    }
}

/// The only unique constraint on `work_sessions` besides the primary key is
/// the one-active-session-per-user index.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
