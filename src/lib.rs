pub mod api;
pub mod config;
pub mod db;
pub mod timer;
pub mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;

use api::{AppState, StaticTokens};
use config::ServerConfig;
use db::{Database, SessionUpdate};
use timer::{commands, StartRequest};

#[derive(Parser)]
#[command(name = "shiftclock")]
#[command(about = "Clock in, pause and clock out against a work session server")]
#[command(version)]
struct Cli {
    /// Client settings file
    #[arg(long, global = true, default_value = "shiftclock-client.json")]
    settings: PathBuf,

    /// Where the client keeps its timer between runs
    #[arg(long, global = true, default_value = "shiftclock-timer.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the work session API server
    Serve,

    /// Update client settings
    Configure {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        /// Background refresh interval (raised to at least 60s)
        #[arg(long)]
        wake_interval_secs: Option<u64>,
    },

    /// Show the current timer
    Status,

    /// Clock in
    Start {
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long = "rate")]
        hourly_rate: Option<f64>,
    },

    Pause,
    Resume,

    /// Close the running session and open a fresh one
    Restart,

    /// Clock out
    Stop {
        /// Record this many minutes instead of the measured duration
        #[arg(long)]
        duration_minutes: Option<i64>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long = "rate")]
        hourly_rate: Option<f64>,
        /// Document reference; repeat for several
        #[arg(long = "evidence", value_name = "REF")]
        evidence: Vec<String>,
    },

    /// Follow the timer until Ctrl-C
    Watch {
        #[arg(long)]
        seconds: Option<u64>,
    },
}

pub fn run() -> Result<()> {
    // RUST_LOG overrides the default level.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        settings,
        state,
        command,
    } = cli;

    let output = match command {
        Commands::Serve => {
            serve(ServerConfig::load()?).await?;
            return Ok(());
        }
        Commands::Configure {
            base_url,
            token,
            wake_interval_secs,
        } => {
            let patch = commands::SettingsPatch {
                base_url,
                token,
                wake_interval_secs,
            };
            let saved = commands::configure(settings.clone(), patch)?;
            format!(
                "saved {} (server {}, wake every {}s)",
                settings.display(),
                saved.base_url,
                saved.wake_interval().as_secs()
            )
        }
        Commands::Status => commands::status(settings, state).await?,
        Commands::Start {
            description,
            location,
            hourly_rate,
        } => {
            let request = StartRequest {
                description,
                location,
                hourly_rate,
            };
            commands::start_timer(settings, state, request).await?
        }
        Commands::Pause => commands::pause_timer(settings, state).await?,
        Commands::Resume => commands::resume_timer(settings, state).await?,
        Commands::Restart => commands::restart_timer(settings, state).await?,
        Commands::Stop {
            duration_minutes,
            description,
            location,
            hourly_rate,
            evidence,
        } => {
            let update = SessionUpdate {
                description,
                location,
                hourly_rate,
                evidence: (!evidence.is_empty()).then_some(evidence),
            };
            commands::stop_timer(settings, state, duration_minutes, update).await?
        }
        Commands::Watch { seconds } => {
            commands::watch_timer(settings, state, seconds.map(Duration::from_secs)).await?;
            return Ok(());
        }
    };

    println!("{output}");
    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!("shiftclock server starting up...");
    if config.tokens.is_empty() {
        warn!("No API tokens configured; every authenticated request will be rejected");
    }

    let database = Database::new(config.database_path.clone())?;
    let state = AppState::new(database, Arc::new(StaticTokens::new(config.tokens)));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    api::serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, draining connections");
}
