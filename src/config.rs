use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

pub const CONFIG_ENV: &str = "SHIFTCLOCK_CONFIG";
pub const BIND_ENV: &str = "SHIFTCLOCK_BIND";
pub const DB_ENV: &str = "SHIFTCLOCK_DB";
pub const TOKEN_ENV: &str = "SHIFTCLOCK_TOKEN";
pub const DEBUG_ENV: &str = "SHIFTCLOCK_DEBUG";

/// OS schedulers will not honour anything tighter than this for background
/// refreshes, so shorter intervals are raised to it.
pub const MIN_WAKE_INTERVAL_SECS: u64 = 60;

pub fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    /// Bearer token -> user id.
    pub tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".into(),
            database_path: PathBuf::from("shiftclock.sqlite3"),
            tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// File named by `SHIFTCLOCK_CONFIG` (defaults when unset or missing),
    /// then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(BIND_ENV) {
            self.bind_addr = bind;
        }
        if let Some(db) = lookup(DB_ENV) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(pair) = lookup(TOKEN_ENV) {
            let (token, user_id) = pair
                .split_once(':')
                .filter(|(token, user)| !token.is_empty() && !user.is_empty())
                .ok_or_else(|| anyhow!("{TOKEN_ENV} must look like <token>:<userId>"))?;
            self.tokens.insert(token.to_string(), user_id.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub tick_interval_ms: u64,
    pub persist_every_ticks: u32,
    pub wake_interval_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            token: None,
            tick_interval_ms: 1000,
            persist_every_ticks: 10,
            wake_interval_secs: MIN_WAKE_INTERVAL_SECS,
        }
    }
}

impl ClientSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs.max(MIN_WAKE_INTERVAL_SECS))
    }

    /// Debug mode persists the elapsed cache on every tick.
    pub fn effective_persist_every(&self) -> u32 {
        if debug_mode() {
            1
        } else {
            self.persist_every_ticks.max(1)
        }
    }
}

/// Client settings backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<ClientSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring unreadable settings at {}: {err}",
                    path.display()
                );
                ClientSettings::default()
            })
        } else {
            ClientSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn get(&self) -> ClientSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: ClientSettings) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &ClientSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
