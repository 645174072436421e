use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::db::{NewWorkSession, RestartOutcome, SessionUpdate, StopFields, WorkSession};
use crate::utils::time::parse_timestamp_strict;

use super::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    AppState,
};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub start_time: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<f64>,
}

/// `PUT /sessions/{id}` body. An `endTime` means "clock out now"; the
/// server clock, not the supplied value, becomes the recorded end.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    pub end_time: Option<String>,
    pub duration_minutes: Option<i64>,
    #[serde(flatten)]
    pub update: SessionUpdate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

/// Empty bodies decode to `T::default()`.
fn parse_body<T>(body: &Bytes) -> ApiResult<T>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("invalid JSON: {err}")))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WorkSession>)> {
    let request: StartSessionRequest = parse_body(&body)?;
    let start_time = request
        .start_time
        .as_deref()
        .map(parse_timestamp_strict)
        .transpose()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let new = NewWorkSession {
        start_time,
        description: request.description,
        location: request.location,
        hourly_rate: request.hourly_rate,
    };
    let session = state.db.create_session(&user.user_id, new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<WorkSession>>> {
    let Query(query) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let sessions = state.db.list_sessions(&user.user_id, limit, offset).await?;
    Ok(Json(sessions))
}

/// `null` when the caller is clocked out.
pub async fn get_active_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Option<WorkSession>>> {
    Ok(Json(state.db.get_active_session(&user.user_id).await?))
}

pub async fn pause_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<WorkSession>> {
    Ok(Json(state.db.pause_session(&user.user_id, Utc::now()).await?))
}

pub async fn resume_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<WorkSession>> {
    Ok(Json(state.db.resume_session(&user.user_id, Utc::now()).await?))
}

pub async fn restart_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<RestartOutcome>> {
    Ok(Json(state.db.restart_session(&user.user_id, Utc::now()).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkSession>> {
    Ok(Json(state.db.get_session(&user.user_id, &id).await?))
}

pub async fn update_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<WorkSession>> {
    let request: UpdateSessionRequest = parse_body(&body)?;
    let now = Utc::now();

    let session = match request.end_time.as_deref() {
        Some(raw) => {
            parse_timestamp_strict(raw).map_err(|err| ApiError::BadRequest(err.to_string()))?;
            let fields = StopFields {
                duration_minutes: request.duration_minutes,
                update: request.update,
            };
            state.db.stop_session(&user.user_id, &id, fields, now).await?
        }
        None => {
            state
                .db
                .update_session(
                    &user.user_id,
                    &id,
                    request.update,
                    request.duration_minutes,
                    now,
                )
                .await?
        }
    };
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.delete_session(&user.user_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
