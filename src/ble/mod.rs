//! BLE transport abstraction.
//!
//! ```text
//!   BluetoothTransport ──connect──▶ BleDevice ──services──▶ GattService
//!          │                            │                       │
//!      start/scan                 on_disconnected        GattCharacteristic
//!                                                     read / write / subscribe
//! ```
//!
//! Platform backends implement these traits; everything above them only talks
//! to the process-wide [`radio::BleRadio`], which serializes access.

pub mod protocol;
pub mod radio;
pub mod uuids;

#[cfg(feature = "btleplug")]
pub mod btleplug;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::error::BleError;

pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type ScanHandler = Arc<dyn Fn(DiscoveredDevice) + Send + Sync>;

/// Result of bringing up the platform BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStart {
    Started,
    Denied,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Live notification subscription. Dropping it without calling
/// `unsubscribe` leaves the platform listener registered.
pub struct Subscription {
    uuid: Uuid,
    cancel: Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>,
}

impl Subscription {
    pub fn new<F>(uuid: Uuid, cancel: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            uuid,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel().await;
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("uuid", &self.uuid).finish()
    }
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn properties(&self) -> CharProps;
    async fn read(&self) -> Result<Vec<u8>, BleError>;
    async fn write(&self, data: &[u8]) -> Result<(), BleError>;
    async fn subscribe(&self, handler: NotifyHandler) -> Result<Subscription, BleError>;
}

#[derive(Clone)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Arc<dyn GattCharacteristic>>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<Arc<dyn GattCharacteristic>> {
        self.characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }
}

#[async_trait]
pub trait BleDevice: Send + Sync {
    fn id(&self) -> String;
    fn name(&self) -> Option<String>;
    /// Services discovered at connect time.
    fn services(&self) -> Vec<GattService>;
    fn is_connected(&self) -> bool;
    /// Register a callback for link loss not initiated by `disconnect`.
    fn on_disconnected(&self, handler: DisconnectHandler);
    async fn disconnect(&self) -> Result<(), BleError>;
}

#[async_trait]
pub trait BluetoothTransport: Send + Sync {
    async fn start(&self) -> TransportStart;
    /// `Ok(None)` means the device is not reachable right now.
    async fn connect(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError>;
    async fn start_scan(&self, on_device: ScanHandler) -> Result<(), BleError>;
    async fn stop_scan(&self) -> Result<(), BleError>;
}

/// Look up `service`/`characteristic` on a device.
pub fn find_characteristic(
    device: &dyn BleDevice,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Arc<dyn GattCharacteristic>> {
    device
        .services()
        .iter()
        .filter(|s| s.uuid == service)
        .find_map(|s| s.characteristic(characteristic))
}
