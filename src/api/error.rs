use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::db::SessionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthenticated,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Session(err) => {
                let status = match err {
                    SessionError::NotFound => StatusCode::NOT_FOUND,
                    SessionError::AlreadyActive | SessionError::InvalidState(_) => {
                        StatusCode::CONFLICT
                    }
                    SessionError::Validation(_) => StatusCode::BAD_REQUEST,
                    SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.kind())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = match &self {
            ApiError::Session(SessionError::Storage(err)) => {
                error!("Storage failure while handling request: {err:#}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": kind, "message": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_status_codes() {
        let cases = [
            (ApiError::from(SessionError::NotFound), StatusCode::NOT_FOUND),
            (ApiError::from(SessionError::AlreadyActive), StatusCode::CONFLICT),
            (
                ApiError::from(SessionError::InvalidState("paused".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(SessionError::Validation("rate".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SessionError::Storage(anyhow::anyhow!("disk"))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
