//! Tracing subscriber setup.

use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "wearlink=debug,info".into(),
            json: false,
            thread_ids: true,
        }
    }
}

/// Install the global subscriber. Returns false if one was already set
/// (embedding hosts and tests commonly install their own).
pub fn init(cfg: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cfg.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(cfg.thread_ids),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(cfg.thread_ids),
            )
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::info!(level = %cfg.level, json = cfg.json, "logging initialized");
            true
        }
        Err(_) => false,
    }
}
