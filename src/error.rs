//! Error taxonomy.
//! Transient errors are retried by `retry::with_backoff`; everything else is
//! terminal for the operation that raised it.

use thiserror::Error;

use crate::retry::Retryable;

/// BLE transport / device errors.
#[derive(Debug, Error)]
pub enum BleError {
    #[error("bluetooth unavailable: {0}")]
    Unavailable(String),
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("connect to {id} timed out after {timeout_ms}ms")]
    ConnectTimeout { id: String, timeout_ms: u64 },
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("characteristic {0} missing")]
    MissingCharacteristic(uuid::Uuid),
    #[error("gatt operation failed: {0}")]
    Gatt(String),
}

impl Retryable for BleError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BleError::ConnectTimeout { .. }
                | BleError::NotFound(_)
                | BleError::Disconnected
                | BleError::Gatt(_)
        )
    }
}

/// Audio decoder errors. Never escape `AudioCodec::decode`; they are logged
/// and replaced with silence.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("decoder not started")]
    NotStarted,
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("no decoder available for {0}")]
    Unavailable(String),
}

/// Endpointing engine misuse. These are programming errors surfaced
/// at the call site rather than absorbed into the segmentation state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointingError {
    #[error("no active endpointing session")]
    NoSession,
    #[error("unsupported sample rate {0}")]
    UnsupportedRate(u32),
}

/// Persisted key-value storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored value for {key} is invalid: {reason}")]
    Invalid { key: String, reason: String },
    #[error("serialize {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Update transport / sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("cancelled")]
    Cancelled,
}

impl Retryable for SyncError {
    fn is_transient(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SyncError::Status { status, .. } => *status == 429 || *status >= 500,
            SyncError::Malformed(_) | SyncError::Storage(_) | SyncError::Cancelled => false,
        }
    }
}

/// Segment upload errors.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}")]
    Status { status: u16 },
    #[error("compression failed: {0}")]
    Compress(String),
}

impl Retryable for UploadError {
    fn is_transient(&self) -> bool {
        match self {
            UploadError::Http(_) => true,
            UploadError::Status { status } => *status == 429 || *status >= 500,
            UploadError::Compress(_) => false,
        }
    }
}

/// Pairing-flow result classification surfaced to callers.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Transport-level failure; the user may retry.
    #[error("connection error: {0}")]
    Connection(#[from] BleError),
    /// No protocol resolver matched, or the stored profile failed validation.
    #[error("unsupported device: {0}")]
    Unsupported(String),
    /// The profile could not be persisted; reported like a connection
    /// failure since retrying may succeed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl PairingError {
    /// Stable classification string (`connection-error` / `unsupported`).
    pub fn kind(&self) -> &'static str {
        match self {
            PairingError::Connection(_) | PairingError::Storage(_) => "connection-error",
            PairingError::Unsupported(_) => "unsupported",
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Failure to bring up the runtime in [`crate::Wearlink::start`].
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("update transport: {0}")]
    Sync(#[from] SyncError),
    #[error("segment uploader: {0}")]
    Upload(#[from] UploadError),
}
