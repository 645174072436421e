//! Command-line front end for the client timer. Each invocation builds a
//! controller over the persisted mirror, reconciles with the server, runs
//! one action and flushes before exiting.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::{
    config::{ClientSettings, SettingsStore},
    db::{SessionUpdate, WorkSession},
    utils::time::format_timestamp,
};

use super::{
    background::IntervalWake,
    client::{ClientError, HttpSessionApi, StartRequest, StopRequest},
    controller::{TimerController, TimerSnapshot},
    state::TimerStatus,
    store::TimerStore,
};

/// Edits to the persisted client settings. `None` keeps the current value.
#[derive(Debug, Default, Clone)]
pub struct SettingsPatch {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub wake_interval_secs: Option<u64>,
}

pub fn configure(settings_path: PathBuf, patch: SettingsPatch) -> Result<ClientSettings> {
    let store = SettingsStore::new(settings_path)?;
    let mut settings = store.get();
    if let Some(base_url) = patch.base_url {
        settings.base_url = base_url;
    }
    if let Some(token) = patch.token {
        settings.token = Some(token);
    }
    if let Some(secs) = patch.wake_interval_secs {
        settings.wake_interval_secs = secs;
    }
    store.update(settings.clone())?;
    Ok(settings)
}

async fn open_controller(settings_path: PathBuf, state_path: PathBuf) -> Result<TimerController> {
    let settings = SettingsStore::new(settings_path)?.get();
    let api = HttpSessionApi::from_settings(&settings)
        .context("configure a token first with `shiftclock configure --token <TOKEN>`")?;
    let store = TimerStore::open(state_path)?;
    Ok(TimerController::new(
        Arc::new(api),
        store,
        Arc::new(IntervalWake::new()),
        &settings,
    ))
}

/// Initializes, runs `action`, then shuts the controller down even when
/// initialization or the action failed.
async fn with_controller<F, Fut, T>(
    settings_path: PathBuf,
    state_path: PathBuf,
    action: F,
) -> Result<T>
where
    F: FnOnce(TimerController) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ClientError>>,
{
    let controller = open_controller(settings_path, state_path).await?;
    let result = match controller.initialize().await {
        Ok(_) => action(controller.clone()).await,
        Err(err) => Err(err),
    };
    controller.shutdown().await?;
    Ok(result?)
}

pub async fn status(settings_path: PathBuf, state_path: PathBuf) -> Result<String> {
    let controller = open_controller(settings_path, state_path).await?;
    let reconciled = controller.initialize().await;
    let snapshot = controller.snapshot();
    controller.shutdown().await?;

    let mut line = render(&snapshot);
    if let Err(err) = reconciled {
        line.push_str(&format!(" [offline: {err}]"));
    }
    Ok(line)
}

pub async fn start_timer(
    settings_path: PathBuf,
    state_path: PathBuf,
    request: StartRequest,
) -> Result<String> {
    let snapshot = with_controller(settings_path, state_path, |controller| async move {
        controller.start(request).await
    })
    .await?;
    Ok(render(&snapshot))
}

pub async fn pause_timer(settings_path: PathBuf, state_path: PathBuf) -> Result<String> {
    let snapshot = with_controller(settings_path, state_path, |controller| async move {
        controller.pause().await
    })
    .await?;
    Ok(render(&snapshot))
}

pub async fn resume_timer(settings_path: PathBuf, state_path: PathBuf) -> Result<String> {
    let snapshot = with_controller(settings_path, state_path, |controller| async move {
        controller.resume().await
    })
    .await?;
    Ok(render(&snapshot))
}

pub async fn restart_timer(settings_path: PathBuf, state_path: PathBuf) -> Result<String> {
    let snapshot = with_controller(settings_path, state_path, |controller| async move {
        controller.restart().await
    })
    .await?;
    Ok(render(&snapshot))
}

pub async fn stop_timer(
    settings_path: PathBuf,
    state_path: PathBuf,
    duration_minutes: Option<i64>,
    update: SessionUpdate,
) -> Result<String> {
    let request = StopRequest {
        duration_minutes,
        update,
    };
    let session = with_controller(settings_path, state_path, |controller| async move {
        controller.stop(request).await
    })
    .await?;
    Ok(render_finished(&session))
}

/// Prints every published snapshot until Ctrl-C or `limit` elapses.
pub async fn watch_timer(
    settings_path: PathBuf,
    state_path: PathBuf,
    limit: Option<Duration>,
) -> Result<()> {
    let controller = open_controller(settings_path, state_path).await?;
    if let Err(err) = controller.initialize().await {
        log::warn!("Showing last known timer state: {err}");
    }

    let mut rx = controller.subscribe();
    println!("{}", render(&rx.borrow_and_update()));

    let printer = print_updates(&mut rx);
    let stop = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::select! {
        _ = printer => {}
        _ = stop => {}
    }

    controller.shutdown().await?;
    Ok(())
}

async fn print_updates(rx: &mut watch::Receiver<TimerSnapshot>) {
    while rx.changed().await.is_ok() {
        println!("{}", render(&rx.borrow_and_update()));
    }
}

pub fn render(snapshot: &TimerSnapshot) -> String {
    let state = &snapshot.state;
    match (state.status, state.session_id.as_deref()) {
        (TimerStatus::Idle, _) | (_, None) => "idle 00:00:00".to_string(),
        (TimerStatus::Running, Some(id)) => format!("running {} (session {id})", snapshot.display),
        (TimerStatus::Paused, Some(id)) => format!("paused {} (session {id})", snapshot.display),
    }
}

fn render_finished(session: &WorkSession) -> String {
    let ended = session
        .end_time
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "stopped session {} at {ended}: {} minute(s)",
        session.id,
        session.duration_minutes.unwrap_or_default()
    )
}
