//! btleplug-backed transport (BlueZ / CoreBluetooth / WinRT).
//!
//! btleplug multiplexes all notifications of a peripheral onto one stream,
//! so each connected device runs a router task that fans values out to the
//! per-characteristic handlers, plus a watcher task that turns adapter
//! disconnect events into `on_disconnected` callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BleDevice, BluetoothTransport, CharProps, DisconnectHandler, DiscoveredDevice,
    GattCharacteristic, GattService, NotifyHandler, ScanHandler, Subscription, TransportStart,
};
use crate::error::BleError;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => BleError::PermissionDenied,
            btleplug::Error::DeviceNotFound => BleError::NotFound("peripheral".into()),
            btleplug::Error::NotConnected => BleError::Disconnected,
            other => BleError::Gatt(other.to_string()),
        }
    }
}

pub struct BtleplugTransport {
    adapter: Mutex<Option<Adapter>>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BtleplugTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self {
            adapter: Mutex::new(None),
            scan: Mutex::new(None),
        }
    }

    fn adapter(&self) -> Result<Adapter, BleError> {
        self.adapter
            .lock()
            .clone()
            .ok_or_else(|| BleError::Unavailable("transport not started".into()))
    }

    async fn find(&self, adapter: &Adapter, id: &str) -> Result<Option<Peripheral>, BleError> {
        let peripherals = adapter.peripherals().await?;
        Ok(peripherals.into_iter().find(|p| p.id().to_string() == id))
    }
}

#[async_trait]
impl BluetoothTransport for BtleplugTransport {
    async fn start(&self) -> TransportStart {
        let manager = match Manager::new().await {
            Ok(m) => m,
            Err(btleplug::Error::PermissionDenied) => return TransportStart::Denied,
            Err(e) => return TransportStart::Failure(e.to_string()),
        };
        let adapters = match manager.adapters().await {
            Ok(a) => a,
            Err(btleplug::Error::PermissionDenied) => return TransportStart::Denied,
            Err(e) => return TransportStart::Failure(e.to_string()),
        };
        match adapters.into_iter().next() {
            Some(adapter) => {
                if let Ok(info) = adapter.adapter_info().await {
                    info!(adapter = %info, "bluetooth adapter selected");
                }
                *self.adapter.lock() = Some(adapter);
                TransportStart::Started
            }
            None => TransportStart::Failure("no bluetooth adapter".into()),
        }
    }

    async fn connect(
        &self,
        id: &str,
        _timeout: Duration,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError> {
        let adapter = self.adapter()?;
        let Some(peripheral) = self.find(&adapter, id).await? else {
            return Ok(None);
        };
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        let device = BtleDevice::attach(adapter, peripheral, id.to_string()).await?;
        Ok(Some(device))
    }

    async fn start_scan(&self, on_device: ScanHandler) -> Result<(), BleError> {
        let adapter = self.adapter()?;
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        let scan_adapter = adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(p) = scan_adapter.peripheral(&id).await else { continue };
                let props = p.properties().await.ok().flatten();
                on_device(DiscoveredDevice {
                    id: id.to_string(),
                    name: props.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: props.as_ref().and_then(|p| p.rssi),
                });
            }
        });
        if let Some(old) = self.scan.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
        }
        match self.adapter() {
            Ok(adapter) => Ok(adapter.stop_scan().await?),
            Err(_) => Ok(()),
        }
    }
}

type HandlerTable = HashMap<Uuid, Vec<(u64, NotifyHandler)>>;

/// Fans one peripheral's notification stream out to per-characteristic
/// handlers.
#[derive(Default)]
struct Router {
    handlers: Mutex<HandlerTable>,
    next: AtomicU64,
}

impl Router {
    fn add(&self, uuid: Uuid, handler: NotifyHandler) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().entry(uuid).or_default().push((token, handler));
        token
    }

    /// Returns true when no handler remains for `uuid`.
    fn remove(&self, uuid: Uuid, token: u64) -> bool {
        let mut table = self.handlers.lock();
        let Some(list) = table.get_mut(&uuid) else { return true };
        list.retain(|(t, _)| *t != token);
        if list.is_empty() {
            table.remove(&uuid);
            true
        } else {
            false
        }
    }

    fn dispatch(&self, uuid: Uuid, value: &[u8]) {
        let handlers: Vec<NotifyHandler> = match self.handlers.lock().get(&uuid) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for h in handlers {
            h(value);
        }
    }
}

struct BtleDevice {
    id: String,
    name: Option<String>,
    peripheral: Peripheral,
    services: Vec<GattService>,
    on_disconnect: Arc<Mutex<Vec<DisconnectHandler>>>,
    requested: Arc<AtomicBool>,
    tasks: CancellationToken,
}

impl BtleDevice {
    async fn attach(
        adapter: Adapter,
        peripheral: Peripheral,
        id: String,
    ) -> Result<Arc<dyn BleDevice>, BleError> {
        let name = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name);
        let router = Arc::new(Router::default());
        let tasks = CancellationToken::new();

        let services = peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .into_iter()
                    .map(|c| {
                        Arc::new(BtleCharacteristic {
                            peripheral: peripheral.clone(),
                            characteristic: c,
                            router: Arc::clone(&router),
                        }) as Arc<dyn GattCharacteristic>
                    })
                    .collect(),
            })
            .collect();

        let mut notifications = peripheral.notifications().await?;
        let route_cancel = tasks.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = route_cancel.cancelled() => break,
                    n = notifications.next() => match n {
                        Some(n) => router.dispatch(n.uuid, &n.value),
                        None => break,
                    },
                }
            }
        });

        let on_disconnect: Arc<Mutex<Vec<DisconnectHandler>>> = Arc::default();
        let requested = Arc::new(AtomicBool::new(false));
        let mut events = adapter.events().await?;
        let watch_cancel = tasks.clone();
        let watch_handlers = Arc::clone(&on_disconnect);
        let watch_requested = Arc::clone(&requested);
        let pid = peripheral.id();
        let watch_id = id.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = watch_cancel.cancelled() => return,
                    e = events.next() => match e {
                        Some(e) => e,
                        None => return,
                    },
                };
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone != pid {
                        continue;
                    }
                    watch_cancel.cancel();
                    if watch_requested.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(device_id = %watch_id, "peripheral dropped the link");
                    let handlers = watch_handlers.lock().clone();
                    for h in handlers {
                        h();
                    }
                    return;
                }
            }
        });

        Ok(Arc::new(Self {
            id,
            name,
            peripheral,
            services,
            on_disconnect,
            requested,
            tasks,
        }))
    }
}

#[async_trait]
impl BleDevice for BtleDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn services(&self) -> Vec<GattService> {
        self.services.clone()
    }

    fn is_connected(&self) -> bool {
        !self.tasks.is_cancelled()
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        self.on_disconnect.lock().push(handler);
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.requested.store(true, Ordering::SeqCst);
        self.tasks.cancel();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

struct BtleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    router: Arc<Router>,
}

#[async_trait]
impl GattCharacteristic for BtleCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    fn properties(&self) -> CharProps {
        let p = self.characteristic.properties;
        CharProps {
            read: p.contains(CharPropFlags::READ),
            write: p.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: p.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
        }
    }

    async fn read(&self) -> Result<Vec<u8>, BleError> {
        Ok(self.peripheral.read(&self.characteristic).await?)
    }

    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        Ok(self
            .peripheral
            .write(&self.characteristic, data, WriteType::WithResponse)
            .await?)
    }

    async fn subscribe(&self, handler: NotifyHandler) -> Result<Subscription, BleError> {
        if !self.properties().notify {
            return Err(BleError::Gatt(format!(
                "{} does not notify",
                self.characteristic.uuid
            )));
        }
        self.peripheral.subscribe(&self.characteristic).await?;
        let uuid = self.characteristic.uuid;
        let token = self.router.add(uuid, handler);
        let router = Arc::clone(&self.router);
        let peripheral = self.peripheral.clone();
        let characteristic = self.characteristic.clone();
        Ok(Subscription::new(uuid, move || {
            Box::pin(async move {
                if router.remove(uuid, token) {
                    if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                        debug!(%uuid, error = %e, "unsubscribe failed");
                    }
                }
            })
        }))
    }
}
