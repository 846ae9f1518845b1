//! One paired device's connection lifecycle.
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──probe──▶ Connected ◀──▶ Subscribed
//!        ▲                                            │              │
//!        └───────────── teardown (stop / link loss) ──┴──────────────┘
//! ```
//!
//! Every update cycle (connect, probe, streaming reconcile, teardown) runs
//! while holding the global radio lock. Teardown is a single function shared
//! by `stop()` and hardware link loss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::battery;
use super::DeviceConnectionState;
use crate::ble::protocol::{resolve_protocol, ProtocolDefinition, ProtocolInfo};
use crate::ble::radio::{BleRadio, RadioGuard};
use crate::ble::uuids::*;
use crate::ble::{find_characteristic, BleDevice, GattCharacteristic, Subscription};
use crate::config::BleConfig;
use crate::error::BleError;

/// Events delivered to the session owner, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Battery / mute probing finished. Sent exactly once per connection.
    Ready {
        battery: Option<u8>,
        muted: Option<bool>,
    },
    StreamingStarted(ProtocolInfo),
    /// Raw notification payload from the audio source characteristic.
    Audio(Vec<u8>),
    StreamingStopped,
    BatteryChanged(u8),
    MuteChanged(bool),
    Disconnected { requested: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Requested,
    LinkLost,
    /// Linked, but streaming could not be set up.
    SetupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

#[derive(Debug)]
struct Live {
    phase: Phase,
    battery: Option<u8>,
    muted: Option<bool>,
}

impl Live {
    fn snapshot(&self) -> DeviceConnectionState {
        match self.phase {
            Phase::Disconnected => DeviceConnectionState::Disconnected,
            Phase::Connecting => DeviceConnectionState::Connecting,
            Phase::Connected => DeviceConnectionState::Connected {
                battery: self.battery,
                muted: self.muted,
            },
            Phase::Subscribed => DeviceConnectionState::Subscribed {
                battery: self.battery,
                muted: self.muted,
            },
        }
    }

    fn linked(&self) -> bool {
        matches!(self.phase, Phase::Connected | Phase::Subscribed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Reading {
    BatteryLevel,
    CompassVoltage,
    Mute,
}

impl Reading {
    fn name(self) -> &'static str {
        match self {
            Reading::BatteryLevel => "battery",
            Reading::CompassVoltage => "compass_voltage",
            Reading::Mute => "mute",
        }
    }
}

/// Resources tied to the current connection. Only touched under the radio lock.
#[derive(Default)]
struct Link {
    device: Option<Arc<dyn BleDevice>>,
    protocol: Option<ProtocolDefinition>,
    mute_sub: Option<Subscription>,
    battery_sub: Option<Subscription>,
    audio_sub: Option<Subscription>,
    polls: Option<CancellationToken>,
}

pub struct DeviceSession {
    device_id: String,
    radio: Arc<BleRadio>,
    config: BleConfig,
    link: AsyncMutex<Link>,
    live: Mutex<Live>,
    state_tx: watch::Sender<DeviceConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Bumped on every teardown; callbacks from older links are ignored.
    epoch: AtomicU64,
    streaming_wanted: AtomicBool,
    this: Weak<DeviceSession>,
}

impl DeviceSession {
    pub fn new(
        device_id: impl Into<String>,
        radio: Arc<BleRadio>,
        config: BleConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DeviceConnectionState::Disconnected);
        let session = Arc::new_cyclic(|this| Self {
            device_id: device_id.into(),
            radio,
            config,
            link: AsyncMutex::new(Link::default()),
            live: Mutex::new(Live {
                phase: Phase::Disconnected,
                battery: None,
                muted: None,
            }),
            state_tx,
            events,
            epoch: AtomicU64::new(0),
            streaming_wanted: AtomicBool::new(false),
            this: this.clone(),
        });
        (session, rx)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> DeviceConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DeviceConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_streaming_requested(&self) -> bool {
        self.streaming_wanted.load(Ordering::SeqCst)
    }

    /// Connect (or adopt `initial`, an already-connected handle from pairing),
    /// probe battery / mute, then reconcile streaming. No-op when linked.
    pub async fn start(&self, initial: Option<Arc<dyn BleDevice>>) -> Result<(), BleError> {
        let guard = self.radio.lock().await;
        let mut link = self.link.lock().await;
        if link.device.is_some() {
            debug!(device_id = %self.device_id, "session already linked");
            return Ok(());
        }

        self.set_phase(Phase::Connecting);
        let device = match initial {
            Some(d) => d,
            None => match guard.connect(&self.device_id, self.config.connect_timeout()).await {
                Ok(d) => d,
                Err(e) => {
                    self.set_phase(Phase::Disconnected);
                    return Err(e);
                }
            },
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let weak = self.this.clone();
        device.on_disconnected(Arc::new(move || {
            let Some(session) = weak.upgrade() else { return };
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move { session.handle_link_loss(epoch).await });
                }
                Err(_) => warn!("link loss reported outside the runtime"),
            }
        }));
        link.device = Some(Arc::clone(&device));

        self.probe(&mut link, device.as_ref(), epoch).await;

        let (battery, muted) = {
            let mut live = self.live.lock();
            live.phase = Phase::Connected;
            (live.battery, live.muted)
        };
        self.publish();
        info!(device_id = %self.device_id, ?battery, ?muted, "session_ready");
        self.emit(SessionEvent::Ready { battery, muted });

        if let Err(e) = self.reconcile(&mut link, epoch).await {
            warn!(device_id = %self.device_id, error = %e, "streaming setup failed after connect");
            self.teardown(&guard, &mut link, Teardown::SetupFailed).await;
            return Err(e);
        }
        Ok(())
    }

    /// Request streaming on or off. Idempotent: the audio subscription
    /// exists iff streaming is wanted and the device is linked.
    pub async fn set_streaming(&self, enabled: bool) -> Result<(), BleError> {
        self.streaming_wanted.store(enabled, Ordering::SeqCst);
        let _guard = self.radio.lock().await;
        let mut link = self.link.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.reconcile(&mut link, epoch).await
    }

    /// Explicit disconnect. A second call is a no-op.
    pub async fn stop(&self) {
        let guard = self.radio.lock().await;
        let mut link = self.link.lock().await;
        self.teardown(&guard, &mut link, Teardown::Requested).await;
    }

    async fn handle_link_loss(&self, epoch: u64) {
        let guard = self.radio.lock().await;
        let mut link = self.link.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(device_id = %self.device_id, "stale link loss ignored");
            return;
        }
        warn!(device_id = %self.device_id, "device link lost");
        self.teardown(&guard, &mut link, Teardown::LinkLost).await;
    }

    async fn reconcile(&self, link: &mut Link, epoch: u64) -> Result<(), BleError> {
        let wanted = self.streaming_wanted.load(Ordering::SeqCst);
        let Some(device) = link.device.clone() else {
            return Ok(());
        };

        if wanted && link.audio_sub.is_none() {
            if link.protocol.is_none() {
                link.protocol = resolve_protocol(device.as_ref()).await?;
            }
            let Some(protocol) = link.protocol.clone() else {
                warn!(device_id = %self.device_id, "no audio protocol; streaming unavailable");
                return Ok(());
            };
            let weak = self.this.clone();
            let sub = protocol
                .source
                .subscribe(Arc::new(move |data: &[u8]| {
                    if let Some(s) = weak.upgrade() {
                        if s.epoch.load(Ordering::SeqCst) == epoch {
                            s.emit(SessionEvent::Audio(data.to_vec()));
                        }
                    }
                }))
                .await?;
            link.audio_sub = Some(sub);
            self.set_phase(Phase::Subscribed);
            info!(device_id = %self.device_id, codec = %protocol.codec, "streaming_started");
            self.emit(SessionEvent::StreamingStarted(protocol.info()));
        } else if !wanted {
            if let Some(sub) = link.audio_sub.take() {
                sub.unsubscribe().await;
                self.set_phase(Phase::Connected);
                info!(device_id = %self.device_id, "streaming_stopped");
                self.emit(SessionEvent::StreamingStopped);
            }
        }
        Ok(())
    }

    /// Best-effort battery / mute setup: notify when possible, poll when the
    /// characteristic is read-only, leave `None` when absent.
    async fn probe(&self, link: &mut Link, device: &dyn BleDevice, epoch: u64) {
        let polls = CancellationToken::new();

        let battery = find_characteristic(device, BATTERY_SERVICE, BATTERY_LEVEL)
            .map(|c| (c, Reading::BatteryLevel))
            .or_else(|| {
                find_characteristic(device, COMPASS_SERVICE, COMPASS_VOLTAGE)
                    .map(|c| (c, Reading::CompassVoltage))
            });
        if let Some((ch, reading)) = battery {
            link.battery_sub = self.watch_reading(ch, reading, epoch, &polls).await;
        }

        if let Some(ch) = find_characteristic(device, SUPER_SERVICE, SUPER_MUTE) {
            link.mute_sub = self.watch_reading(ch, Reading::Mute, epoch, &polls).await;
        }

        link.polls = Some(polls);
    }

    async fn watch_reading(
        &self,
        ch: Arc<dyn GattCharacteristic>,
        reading: Reading,
        epoch: u64,
        polls: &CancellationToken,
    ) -> Option<Subscription> {
        let props = ch.properties();
        if props.read {
            match ch.read().await {
                Ok(data) => self.apply_reading(reading, &data, epoch),
                Err(e) => debug!(reading = reading.name(), error = %e, "initial read failed"),
            }
        }
        if props.notify {
            let weak = self.this.clone();
            let handler = Arc::new(move |data: &[u8]| {
                if let Some(s) = weak.upgrade() {
                    s.apply_reading(reading, data, epoch);
                }
            });
            match ch.subscribe(handler).await {
                Ok(sub) => return Some(sub),
                Err(e) => debug!(reading = reading.name(), error = %e, "notify subscribe failed"),
            }
        }
        if props.read {
            self.spawn_poll(ch, reading, epoch, polls.child_token());
        }
        None
    }

    fn spawn_poll(
        &self,
        ch: Arc<dyn GattCharacteristic>,
        reading: Reading,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let weak = self.this.clone();
        let period = self.config.poll_interval();
        debug!(reading = reading.name(), period_s = period.as_secs(), "polling read-only characteristic");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let data = match ch.read().await {
                    Ok(d) => d,
                    Err(e) => {
                        debug!(reading = reading.name(), error = %e, "poll read failed");
                        continue;
                    }
                };
                let Some(session) = weak.upgrade() else { break };
                session.apply_reading(reading, &data, epoch);
            }
        });
    }

    fn apply_reading(&self, reading: Reading, data: &[u8], epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let event = {
            let mut live = self.live.lock();
            match reading {
                Reading::BatteryLevel | Reading::CompassVoltage => {
                    let pct = match reading {
                        Reading::CompassVoltage => battery::compass_percent(data),
                        _ => battery::level_percent(data),
                    };
                    match pct {
                        Some(p) if live.battery != Some(p) => {
                            live.battery = Some(p);
                            live.linked().then_some(SessionEvent::BatteryChanged(p))
                        }
                        _ => None,
                    }
                }
                Reading::Mute => {
                    let Some(&b) = data.first() else { return };
                    let muted = b != 0;
                    if live.muted == Some(muted) {
                        None
                    } else {
                        live.muted = Some(muted);
                        live.linked().then_some(SessionEvent::MuteChanged(muted))
                    }
                }
            }
        };
        if let Some(ev) = event {
            self.publish();
            self.emit(ev);
        }
    }

    /// The only teardown path. Order: mute, battery, audio listeners; then
    /// the device handle. The link is released unless it is already gone.
    async fn teardown(&self, guard: &RadioGuard<'_>, link: &mut Link, cause: Teardown) {
        let requested = cause == Teardown::Requested;
        let Some(device) = link.device.take() else {
            debug!(device_id = %self.device_id, "teardown on idle session");
            return;
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(polls) = link.polls.take() {
            polls.cancel();
        }
        if let Some(sub) = link.mute_sub.take() {
            sub.unsubscribe().await;
        }
        if let Some(sub) = link.battery_sub.take() {
            sub.unsubscribe().await;
        }
        let was_streaming = match link.audio_sub.take() {
            Some(sub) => {
                sub.unsubscribe().await;
                true
            }
            None => false,
        };
        link.protocol = None;

        if cause != Teardown::LinkLost {
            if let Err(e) = guard.disconnect(device.as_ref()).await {
                warn!(device_id = %self.device_id, error = %e, "disconnect failed");
            }
        }
        drop(device);

        if was_streaming {
            self.emit(SessionEvent::StreamingStopped);
        }
        {
            let mut live = self.live.lock();
            live.phase = Phase::Disconnected;
            live.battery = None;
            live.muted = None;
        }
        self.publish();
        info!(device_id = %self.device_id, ?cause, was_streaming, "session_torn_down");
        self.emit(SessionEvent::Disconnected { requested });
    }

    fn set_phase(&self, phase: Phase) {
        self.live.lock().phase = phase;
        self.publish();
    }

    fn publish(&self) {
        let next = self.live.lock().snapshot();
        self.state_tx.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        });
    }

    fn emit(&self, ev: SessionEvent) {
        // Receiver gone means the owner is shutting down.
        let _ = self.events.send(ev);
    }
}
