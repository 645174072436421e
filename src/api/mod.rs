//! Authenticated JSON endpoints over the work-session repository. Handlers
//! only authenticate, translate payloads and map errors to status codes.

pub mod auth;
pub mod error;
pub mod handlers;

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use log::info;
use tokio::net::TcpListener;

use crate::db::Database;

pub use auth::{AuthUser, StaticTokens, TokenVerifier};
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new(db: Database, auth: Arc<dyn TokenVerifier>) -> Self {
        Self { db, auth }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/sessions/active", get(handlers::get_active_session))
        .route("/sessions/active/pause", post(handlers::pause_session))
        .route("/sessions/active/resume", post(handlers::resume_session))
        .route("/sessions/active/restart", post(handlers::restart_session))
        .route(
            "/sessions/{id}",
            get(handlers::get_session)
                .put(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("Work session API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server terminated with an error")
}
