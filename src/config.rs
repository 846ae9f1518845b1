//! Runtime configuration: TOML file + environment overrides.
//! Every section defaults, so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::audio::endpointing::EndpointingConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ble: BleConfig,
    pub endpointing: EndpointingConfig,
    pub sync: SyncConfig,
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub connect_timeout_ms: u64,
    /// No frame for this long while subscribed → synthesized streaming stop.
    pub stream_timeout_ms: u64,
    /// Poll period for read-only battery / mute characteristics.
    pub poll_interval_secs: u64,
    /// Decoded audio discarded after each codec start.
    pub warmup_discard_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            stream_timeout_ms: 5_000,
            poll_interval_secs: 15,
            warmup_discard_ms: 200,
        }
    }
}

impl BleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub push_reconnect_min_ms: u64,
    pub push_reconnect_max_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            api_token: None,
            push_reconnect_min_ms: 1_000,
            push_reconnect_max_ms: 4_000,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("wearlink.db"),
        }
    }
}

impl Config {
    /// Load from `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        info!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `WEARLINK_*` overrides through a lookup function.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("WEARLINK_API_URL") {
            self.sync.base_url = url;
        }
        if let Some(token) = lookup("WEARLINK_API_TOKEN") {
            self.sync.api_token = Some(token);
        }
        if let Some(path) = lookup("WEARLINK_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("WEARLINK_LOG") {
            self.log.level = level;
        }
    }
}
