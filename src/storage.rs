//! Durable key-value storage.
//! The core only depends on two cross-restart values: the paired device
//! profile and the applied update watermark. Caches ride along as JSON blobs.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::device::DeviceProfile;
use crate::error::StorageError;

pub const KEY_DEVICE_PROFILE: &str = "device-profile";
pub const KEY_UPDATES_SEQ: &str = "updates-seq";
pub const KEY_LOCAL_MUTED: &str = "local-muted";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// SQLite-backed store (WAL, one `kv` table).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        info!(path = %db_path.display(), "kv store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_unix()],
        )?;
        debug!(key, "kv set");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Volatile store for tests and hosts without a writable disk.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.map.lock().remove(key);
        Ok(())
    }
}

pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|source| StorageError::Serialize {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &raw)
}

pub fn load_profile(store: &dyn KeyValueStore) -> Result<Option<DeviceProfile>, StorageError> {
    let profile: Option<DeviceProfile> = load_json(store, KEY_DEVICE_PROFILE)?;
    match profile {
        Some(p) if p.id.trim().is_empty() => Err(StorageError::Invalid {
            key: KEY_DEVICE_PROFILE.into(),
            reason: "empty device id".into(),
        }),
        other => Ok(other),
    }
}

/// Replaces any previously stored profile (single active wearable).
pub fn save_profile(store: &dyn KeyValueStore, profile: &DeviceProfile) -> Result<(), StorageError> {
    save_json(store, KEY_DEVICE_PROFILE, profile)
}

pub fn clear_profile(store: &dyn KeyValueStore) -> Result<(), StorageError> {
    store.remove(KEY_DEVICE_PROFILE)
}

pub fn load_applied_seq(store: &dyn KeyValueStore) -> Result<Option<u64>, StorageError> {
    match store.get(KEY_UPDATES_SEQ)? {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StorageError::Invalid {
                key: KEY_UPDATES_SEQ.into(),
                reason: e.to_string(),
            }),
    }
}

pub fn save_applied_seq(store: &dyn KeyValueStore, seq: u64) -> Result<(), StorageError> {
    store.set(KEY_UPDATES_SEQ, &seq.to_string())
}

pub fn load_local_muted(store: &dyn KeyValueStore) -> Result<bool, StorageError> {
    Ok(store.get(KEY_LOCAL_MUTED)?.as_deref() == Some("true"))
}

pub fn save_local_muted(store: &dyn KeyValueStore, muted: bool) -> Result<(), StorageError> {
    store.set(KEY_LOCAL_MUTED, if muted { "true" } else { "false" })
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
