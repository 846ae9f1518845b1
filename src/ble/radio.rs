//! Process-wide BLE radio with one serialization lock.
//! Platform stacks misbehave under concurrent connect/discover calls, so
//! every connect, disconnect, scan toggle and session update cycle holds
//! `RadioGuard` for its whole duration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{info, warn};

use super::{BleDevice, BluetoothTransport, ScanHandler, TransportStart};
use crate::error::BleError;
use crate::metrics::{metric_names, MetricsRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RadioStatus {
    Uninitialized,
    Ready,
    /// Permission refused; needs user action in system settings.
    Denied,
    /// Adapter missing or stack failed to start.
    Unavailable,
}

impl std::fmt::Display for RadioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioStatus::Uninitialized => write!(f, "uninitialized"),
            RadioStatus::Ready => write!(f, "ready"),
            RadioStatus::Denied => write!(f, "denied"),
            RadioStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

pub struct BleRadio {
    transport: Arc<dyn BluetoothTransport>,
    lock: Mutex<()>,
    status: RwLock<RadioStatus>,
    status_tx: watch::Sender<RadioStatus>,
    metrics: Arc<MetricsRegistry>,
}

impl BleRadio {
    pub fn new(transport: Arc<dyn BluetoothTransport>, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(RadioStatus::Uninitialized);
        Arc::new(Self {
            transport,
            lock: Mutex::new(()),
            status: RwLock::new(RadioStatus::Uninitialized),
            status_tx,
            metrics,
        })
    }

    /// Bring up the platform stack. Denied / unavailable are sticky until
    /// `destroy` + `init` is called again after user action.
    pub async fn init(&self) -> RadioStatus {
        let _guard = self.lock.lock().await;
        let current = self.status();
        if current != RadioStatus::Uninitialized {
            return current;
        }
        let next = match self.transport.start().await {
            TransportStart::Started => RadioStatus::Ready,
            TransportStart::Denied => RadioStatus::Denied,
            TransportStart::Failure(reason) => {
                warn!(reason = %reason, "bluetooth stack failed to start");
                RadioStatus::Unavailable
            }
        };
        self.set_status(next);
        info!(status = %next, "radio_init");
        next
    }

    pub async fn destroy(&self) {
        let _guard = self.lock.lock().await;
        let _ = self.transport.stop_scan().await;
        self.set_status(RadioStatus::Uninitialized);
        info!("radio_destroyed");
    }

    pub fn status(&self) -> RadioStatus {
        *self.status.read()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RadioStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: RadioStatus) {
        *self.status.write() = status;
        self.status_tx.send_replace(status);
    }

    /// Acquire the global BLE lock.
    pub async fn lock(&self) -> RadioGuard<'_> {
        RadioGuard {
            radio: self,
            _guard: self.lock.lock().await,
        }
    }
}

/// Proof of holding the global BLE lock; all radio operations hang off it.
pub struct RadioGuard<'a> {
    radio: &'a BleRadio,
    _guard: MutexGuard<'a, ()>,
}

impl RadioGuard<'_> {
    fn ensure_ready(&self) -> Result<(), BleError> {
        match self.radio.status() {
            RadioStatus::Ready => Ok(()),
            RadioStatus::Denied => Err(BleError::PermissionDenied),
            other => Err(BleError::Unavailable(other.to_string())),
        }
    }

    /// Connect and discover services, racing the platform call against
    /// `timeout`.
    pub async fn connect(&self, id: &str, timeout: Duration) -> Result<Arc<dyn BleDevice>, BleError> {
        self.ensure_ready()?;
        let started = Instant::now();
        let attempt = tokio::time::timeout(timeout, self.radio.transport.connect(id, timeout)).await;
        let device = match attempt {
            Err(_) => {
                return Err(BleError::ConnectTimeout {
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(result) => result?.ok_or_else(|| BleError::NotFound(id.to_string()))?,
        };
        self.radio.metrics.record(
            metric_names::BLE_CONNECT,
            started.elapsed().as_micros() as f64,
        );
        info!(device_id = %id, elapsed_ms = started.elapsed().as_millis() as u64, "ble_connected");
        Ok(device)
    }

    pub async fn disconnect(&self, device: &dyn BleDevice) -> Result<(), BleError> {
        device.disconnect().await?;
        info!(device_id = %device.id(), "ble_disconnected");
        Ok(())
    }

    pub async fn start_scan(&self, on_device: ScanHandler) -> Result<(), BleError> {
        self.ensure_ready()?;
        self.radio.transport.start_scan(on_device).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.radio.transport.stop_scan().await
    }
}
