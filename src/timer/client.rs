//! Client side of the work-session API.
//!
//! The orchestrator only talks to [`SessionApi`]; [`HttpSessionApi`] is the
//! reqwest adapter used by the CLI and the integration tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::config::ClientSettings;
use crate::db::{RestartOutcome, SessionUpdate, WorkSession};
use crate::utils::time::format_timestamp;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not signed in or token rejected")]
    Unauthenticated,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not allowed right now: {0}")]
    InvalidState(String),
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not reach the server: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no session is running")]
    NoActiveSession,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourly_rate: Option<f64>,
}

/// Clock-out payload. Descriptive fields ride along with the stop.
#[derive(Debug, Clone, Default)]
pub struct StopRequest {
    pub duration_minutes: Option<i64>,
    pub update: SessionUpdate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopBody<'a> {
    end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_minutes: Option<i64>,
    #[serde(flatten)]
    update: &'a SessionUpdate,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Port over the server's session endpoints.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn get_active(&self) -> ClientResult<Option<WorkSession>>;
    async fn start(&self, request: &StartRequest) -> ClientResult<WorkSession>;
    async fn pause(&self) -> ClientResult<WorkSession>;
    async fn resume(&self) -> ClientResult<WorkSession>;
    async fn restart(&self) -> ClientResult<RestartOutcome>;
    async fn stop(&self, session_id: &str, request: &StopRequest) -> ClientResult<WorkSession>;
}

pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> ClientResult<Self> {
        let token = settings
            .token
            .clone()
            .ok_or(ClientError::Unauthenticated)?;
        Self::new(settings.base_url.clone(), token)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ClientResult<T> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|parsed| parsed.message)
            .unwrap_or(body);
        log_warn!("session API answered {status}: {message}");

        Err(match status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthenticated,
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::CONFLICT => ClientError::InvalidState(message),
            other => ClientError::Rejected {
                status: other.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn get_active(&self) -> ClientResult<Option<WorkSession>> {
        log_debug!("GET /sessions/active");
        self.send(self.request(Method::GET, "/sessions/active")).await
    }

    async fn start(&self, request: &StartRequest) -> ClientResult<WorkSession> {
        self.send(self.request(Method::POST, "/sessions").json(request))
            .await
    }

    async fn pause(&self) -> ClientResult<WorkSession> {
        self.send(self.request(Method::POST, "/sessions/active/pause"))
            .await
    }

    async fn resume(&self) -> ClientResult<WorkSession> {
        self.send(self.request(Method::POST, "/sessions/active/resume"))
            .await
    }

    async fn restart(&self) -> ClientResult<RestartOutcome> {
        self.send(self.request(Method::POST, "/sessions/active/restart"))
            .await
    }

    async fn stop(&self, session_id: &str, request: &StopRequest) -> ClientResult<WorkSession> {
        let body = StopBody {
            end_time: format_timestamp(&Utc::now()),
            duration_minutes: request.duration_minutes,
            update: &request.update,
        };
        self.send(
            self.request(Method::PUT, &format!("/sessions/{session_id}"))
                .json(&body),
        )
        .await
    }
}
