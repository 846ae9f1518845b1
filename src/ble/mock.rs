//! In-memory BLE fakes for tests: scripted transport, devices and
//! characteristics that record every subscribe / unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use uuid::Uuid;

use super::uuids::*;
use super::{
    BleDevice, BluetoothTransport, CharProps, DisconnectHandler, DiscoveredDevice,
    GattCharacteristic, GattService, NotifyHandler, ScanHandler, Subscription, TransportStart,
};
use crate::error::BleError;

pub type OpLog = Arc<Mutex<Vec<(&'static str, Uuid)>>>;

pub struct FakeCharacteristic {
    uuid: Uuid,
    props: CharProps,
    value: Mutex<Vec<u8>>,
    fail_read: AtomicBool,
    handlers: Arc<Mutex<Vec<(u64, NotifyHandler)>>>,
    next_id: AtomicU64,
    pub reads: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: Arc<AtomicUsize>,
    log: Mutex<Option<OpLog>>,
}

impl FakeCharacteristic {
    fn make(uuid: Uuid, props: CharProps, value: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            props,
            value: Mutex::new(value),
            fail_read: AtomicBool::new(false),
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            log: Mutex::new(None),
        })
    }

    pub fn notify(uuid: Uuid) -> Arc<Self> {
        Self::make(
            uuid,
            CharProps {
                notify: true,
                ..Default::default()
            },
            Vec::new(),
        )
    }

    pub fn readable(uuid: Uuid, value: Vec<u8>) -> Arc<Self> {
        Self::make(
            uuid,
            CharProps {
                read: true,
                ..Default::default()
            },
            value,
        )
    }

    pub fn notify_readable(uuid: Uuid, value: Vec<u8>) -> Arc<Self> {
        Self::make(
            uuid,
            CharProps {
                read: true,
                notify: true,
                write: false,
            },
            value,
        )
    }

    pub fn failing_read(uuid: Uuid) -> Arc<Self> {
        let c = Self::readable(uuid, Vec::new());
        c.fail_read.store(true, Ordering::SeqCst);
        c
    }

    pub fn set_value(&self, value: Vec<u8>) {
        *self.value.lock() = value;
    }

    /// Push a notification to every live subscriber.
    pub fn emit(&self, data: &[u8]) {
        let handlers: Vec<NotifyHandler> =
            self.handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for h in handlers {
            h(data);
        }
    }

    pub fn live_subscribers(&self) -> usize {
        self.handlers.lock().len()
    }

    fn attach_log(&self, log: OpLog) {
        *self.log.lock() = Some(log);
    }

    fn log_op(&self, op: &'static str) {
        if let Some(log) = self.log.lock().as_ref() {
            log.lock().push((op, self.uuid));
        }
    }
}

#[async_trait]
impl GattCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharProps {
        self.props
    }

    async fn read(&self) -> Result<Vec<u8>, BleError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        Ok(self.value.lock().clone())
    }

    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        *self.value.lock() = data.to_vec();
        Ok(())
    }

    async fn subscribe(&self, handler: NotifyHandler) -> Result<Subscription, BleError> {
        if !self.props.notify {
            return Err(BleError::Gatt("not notifiable".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().push((id, handler));
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.log_op("subscribe");
        let handlers = Arc::clone(&self.handlers);
        let unsubscribes = Arc::clone(&self.unsubscribes);
        let log = self.log.lock().clone();
        let uuid = self.uuid;
        Ok(Subscription::new(uuid, move || {
            async move {
                handlers.lock().retain(|(hid, _)| *hid != id);
                unsubscribes.fetch_add(1, Ordering::SeqCst);
                if let Some(log) = log {
                    log.lock().push(("unsubscribe", uuid));
                }
            }
            .boxed()
        }))
    }
}

pub struct FakeDevice {
    id: String,
    name: String,
    services: Vec<GattService>,
    chars: HashMap<Uuid, Arc<FakeCharacteristic>>,
    connected: AtomicBool,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    pub disconnects: AtomicUsize,
    pub ops: OpLog,
}

pub struct FakeDeviceBuilder {
    id: String,
    name: String,
    services: Vec<(Uuid, Vec<Arc<FakeCharacteristic>>)>,
}

impl FakeDeviceBuilder {
    pub fn service(mut self, uuid: Uuid, chars: Vec<Arc<FakeCharacteristic>>) -> Self {
        self.services.push((uuid, chars));
        self
    }

    pub fn build(self) -> Arc<FakeDevice> {
        let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
        let mut chars = HashMap::new();
        let services = self
            .services
            .into_iter()
            .map(|(uuid, cs)| {
                let characteristics = cs
                    .into_iter()
                    .map(|c| {
                        c.attach_log(Arc::clone(&ops));
                        chars.insert(c.uuid, Arc::clone(&c));
                        c as Arc<dyn GattCharacteristic>
                    })
                    .collect();
                GattService {
                    uuid,
                    characteristics,
                }
            })
            .collect();
        Arc::new(FakeDevice {
            id: self.id,
            name: self.name,
            services,
            chars,
            connected: AtomicBool::new(false),
            disconnect_handlers: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            ops,
        })
    }
}

impl FakeDevice {
    pub fn builder(id: &str, name: &str) -> FakeDeviceBuilder {
        FakeDeviceBuilder {
            id: id.into(),
            name: name.into(),
            services: Vec::new(),
        }
    }

    /// "super" device with notify+read mute and battery characteristics.
    pub fn super_device(id: &str, name: &str, selector: u8) -> Arc<Self> {
        Self::builder(id, name)
            .service(
                SUPER_SERVICE,
                vec![
                    FakeCharacteristic::notify(SUPER_AUDIO),
                    FakeCharacteristic::readable(SUPER_CODEC, vec![selector]),
                    FakeCharacteristic::notify_readable(SUPER_MUTE, vec![0]),
                ],
            )
            .service(
                BATTERY_SERVICE,
                vec![FakeCharacteristic::notify_readable(BATTERY_LEVEL, vec![80])],
            )
            .build()
    }

    pub fn compass_device(id: &str, name: &str) -> Arc<Self> {
        Self::builder(id, name)
            .service(
                COMPASS_SERVICE,
                vec![
                    FakeCharacteristic::notify(COMPASS_AUDIO),
                    FakeCharacteristic::readable(COMPASS_CONTROL, vec![]),
                    FakeCharacteristic::readable(COMPASS_VOLTAGE, 3_900_000_000u32.to_le_bytes().to_vec()),
                ],
            )
            .build()
    }

    pub fn char(&self, uuid: Uuid) -> Arc<FakeCharacteristic> {
        Arc::clone(&self.chars[&uuid])
    }

    /// Hardware-initiated link loss.
    pub fn simulate_link_loss(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let handlers: Vec<DisconnectHandler> = self.disconnect_handlers.lock().clone();
        for h in handlers {
            h();
        }
    }

    pub fn unsubscribe_order(&self) -> Vec<Uuid> {
        self.ops
            .lock()
            .iter()
            .filter(|(op, _)| *op == "unsubscribe")
            .map(|(_, u)| *u)
            .collect()
    }
}

#[async_trait]
impl BleDevice for FakeDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn services(&self) -> Vec<GattService> {
        self.services.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        self.disconnect_handlers.lock().push(handler);
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeTransport {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    start_result: Mutex<TransportStart>,
    connect_delay: Mutex<Duration>,
    fail_connects: AtomicU32,
    pub connects: AtomicUsize,
    scan_handler: Mutex<Option<ScanHandler>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            start_result: Mutex::new(TransportStart::Started),
            connect_delay: Mutex::new(Duration::ZERO),
            fail_connects: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            scan_handler: Mutex::new(None),
        })
    }

    pub fn add_device(&self, dev: Arc<FakeDevice>) {
        self.devices.lock().insert(dev.id.clone(), dev);
    }

    pub fn set_start_result(&self, r: TransportStart) {
        *self.start_result.lock() = r;
    }

    pub fn set_connect_delay(&self, d: Duration) {
        *self.connect_delay.lock() = d;
    }

    /// The next `n` connects fail with a transient GATT error.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn announce(&self, id: &str) {
        let dev = self.devices.lock().get(id).cloned();
        let handler = self.scan_handler.lock().clone();
        if let (Some(dev), Some(h)) = (dev, handler) {
            h(DiscoveredDevice {
                id: dev.id.clone(),
                name: Some(dev.name.clone()),
                rssi: Some(-60),
            });
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_handler.lock().is_some()
    }
}

#[async_trait]
impl BluetoothTransport for FakeTransport {
    async fn start(&self) -> TransportStart {
        self.start_result.lock().clone()
    }

    async fn connect(&self, id: &str, _timeout: Duration) -> Result<Option<Arc<dyn BleDevice>>, BleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BleError::Gatt("flaky link".into()));
        }
        let dev = self.devices.lock().get(id).cloned();
        Ok(dev.map(|d| {
            d.connected.store(true, Ordering::SeqCst);
            d as Arc<dyn BleDevice>
        }))
    }

    async fn start_scan(&self, on_device: ScanHandler) -> Result<(), BleError> {
        *self.scan_handler.lock() = Some(on_device);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        *self.scan_handler.lock() = None;
        Ok(())
    }
}
