//! Top-level wearable façade: pairing, the single active profile, streaming
//! and mute gating, and the stream watchdog.
//!
//! Session events arrive on one pump task per device session and are handled
//! in order. Decoded PCM leaves through `ControllerEvent::Frame`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec::{create_codec, OpusDecoderFactory};
use crate::audio::FrameDecoder;
use crate::ble::protocol::{resolve_protocol, ProtocolInfo};
use crate::ble::radio::{BleRadio, RadioStatus};
use crate::ble::{BleDevice, DiscoveredDevice};
use crate::config::{BleConfig, Config};
use crate::device::session::{DeviceSession, SessionEvent};
use crate::device::{infer_vendor, DeviceConnectionState, DeviceProfile, Vendor};
use crate::error::{BleError, PairingError, StorageError};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::retry::{with_backoff, RetryError, RetryPolicy};
use crate::status::{derive, PairingStatus, StatusInputs, WearableStatus};
use crate::storage::{self, KeyValueStore};

const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StreamingStarted { sample_rate: u32 },
    Frame(Vec<i16>),
    StreamingStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredWearable {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub vendor: Vendor,
}

impl From<DiscoveredDevice> for DiscoveredWearable {
    fn from(d: DiscoveredDevice) -> Self {
        let vendor = infer_vendor(d.name.as_deref().unwrap_or_default());
        Self {
            id: d.id,
            name: d.name,
            rssi: d.rssi,
            vendor,
        }
    }
}

struct Linked {
    session: Arc<DeviceSession>,
    /// Parent of the pump, watchdog and reconnect tasks.
    cancel: CancellationToken,
}

struct Inner {
    pairing: PairingStatus,
    profile: Option<DeviceProfile>,
    linked: Option<Linked>,
    opus: Option<Arc<dyn OpusDecoderFactory>>,
    local_muted: bool,
    device_muted: bool,
    streaming_enabled: bool,
    /// Set while the device session holds an audio subscription.
    protocol: Option<ProtocolInfo>,
    decoder: Option<FrameDecoder>,
    /// Watchdog fired; cleared by the next received frame.
    stalled: bool,
    last_frame: Instant,
    watchdog: Option<CancellationToken>,
    reconnecting: bool,
    last_drop_log: Option<Instant>,
    dropped_since_log: u64,
}

pub struct WearableController {
    radio: Arc<BleRadio>,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<MetricsRegistry>,
    ble: BleConfig,
    retry: RetryPolicy,
    /// Serializes init / pair / unpair.
    lifecycle: AsyncMutex<()>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<WearableStatus>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    this: Weak<WearableController>,
}

impl WearableController {
    pub fn new(
        radio: Arc<BleRadio>,
        store: Arc<dyn KeyValueStore>,
        config: &Config,
        metrics: Arc<MetricsRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(WearableStatus::Loading);
        let ctrl = Arc::new_cyclic(|this| Self {
            radio,
            store,
            metrics,
            ble: config.ble.clone(),
            retry: config.retry.clone(),
            lifecycle: AsyncMutex::new(()),
            inner: Mutex::new(Inner {
                pairing: PairingStatus::Loading,
                profile: None,
                linked: None,
                opus: None,
                local_muted: false,
                device_muted: false,
                streaming_enabled: true,
                protocol: None,
                decoder: None,
                stalled: false,
                last_frame: Instant::now(),
                watchdog: None,
                reconnecting: false,
                last_drop_log: None,
                dropped_since_log: 0,
            }),
            status_tx,
            events,
            this: this.clone(),
        });
        (ctrl, rx)
    }

    /// Install the platform Opus backend. Without one, opus devices pair but
    /// produce no audio.
    pub fn set_opus_backend(&self, factory: Arc<dyn OpusDecoderFactory>) {
        self.inner.lock().opus = Some(factory);
    }

    pub fn status(&self) -> WearableStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WearableStatus> {
        self.status_tx.subscribe()
    }

    pub fn profile(&self) -> Option<DeviceProfile> {
        self.inner.lock().profile.clone()
    }

    pub fn local_muted(&self) -> bool {
        self.inner.lock().local_muted
    }

    /// Bring up the radio, restore persisted state and start reconnecting to
    /// the stored device in the background.
    pub async fn init(&self) -> WearableStatus {
        let _lifecycle = self.lifecycle.lock().await;
        let radio = self.radio.init().await;

        let local_muted = storage::load_local_muted(self.store.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "local mute setting unreadable, defaulting to unmuted");
            false
        });
        let profile = match storage::load_profile(self.store.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, classification = "unsupported", "stored device profile rejected");
                if let Err(e) = storage::clear_profile(self.store.as_ref()) {
                    warn!(error = %e, "failed to clear rejected profile");
                }
                None
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.local_muted = local_muted;
            inner.pairing = if profile.is_some() {
                PairingStatus::Ready
            } else {
                PairingStatus::Unpaired
            };
            inner.profile = profile.clone();
        }

        if let Some(profile) = profile {
            info!(device_id = %profile.id, vendor = %profile.vendor, "restoring paired device");
            if radio == RadioStatus::Ready {
                let session = self.attach(&profile.id);
                let enabled = self.inner.lock().streaming_enabled;
                // link is empty, so this only records the request
                let _ = session.set_streaming(enabled).await;
                self.schedule_reconnect();
            }
        }
        self.publish_status();
        self.status()
    }

    /// Pair with `id`: connect, resolve the protocol, persist the profile and
    /// start the device session. Any failure after connect disconnects.
    pub async fn try_pair_device(&self, id: &str) -> Result<DeviceProfile, PairingError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.detach().await;
        {
            let mut inner = self.inner.lock();
            inner.profile = None;
            inner.pairing = PairingStatus::Pairing;
        }
        self.publish_status();
        info!(device_id = %id, "pairing_started");

        let connected = {
            let guard = self.radio.lock().await;
            guard.connect(id, self.ble.connect_timeout()).await
        };
        let device = match connected {
            Ok(d) => d,
            Err(e) => {
                warn!(device_id = %id, error = %e, kind = "connection-error", "pairing_failed");
                self.set_unpaired();
                return Err(PairingError::Connection(e));
            }
        };

        match self.complete_pairing(id, &device).await {
            Ok(profile) => Ok(profile),
            Err(e) => {
                warn!(device_id = %id, error = %e, kind = e.kind(), "pairing_failed");
                self.detach().await;
                {
                    let guard = self.radio.lock().await;
                    if let Err(e) = guard.disconnect(device.as_ref()).await {
                        warn!(device_id = %id, error = %e, "disconnect after failed pairing");
                    }
                }
                if let Err(e) = storage::clear_profile(self.store.as_ref()) {
                    warn!(error = %e, "failed to clear profile after failed pairing");
                }
                self.set_unpaired();
                Err(e)
            }
        }
    }

    async fn complete_pairing(
        &self,
        id: &str,
        device: &Arc<dyn BleDevice>,
    ) -> Result<DeviceProfile, PairingError> {
        if resolve_protocol(device.as_ref()).await?.is_none() {
            return Err(PairingError::Unsupported(format!(
                "{id}: no known audio protocol"
            )));
        }
        let profile = DeviceProfile::from_advertised(id, device.name().as_deref());
        storage::save_profile(self.store.as_ref(), &profile)?;

        let session = self.attach(id);
        let enabled = self.inner.lock().streaming_enabled;
        session.set_streaming(enabled).await?;
        session.start(Some(Arc::clone(device))).await?;

        {
            let mut inner = self.inner.lock();
            inner.profile = Some(profile.clone());
            inner.pairing = PairingStatus::Ready;
        }
        self.publish_status();
        info!(device_id = %id, vendor = %profile.vendor, name = %profile.name, "pairing_ready");
        Ok(profile)
    }

    /// Unpair: tear down the session and forget the stored profile.
    pub async fn disconnect_device(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.detach().await;
        if let Err(e) = storage::clear_profile(self.store.as_ref()) {
            warn!(error = %e, "failed to clear stored profile");
        }
        self.set_unpaired();
        info!("device_unpaired");
    }

    /// Tear down the session but keep the profile (process shutdown).
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.detach().await;
        self.publish_status();
    }

    pub async fn start_scan<F>(&self, on_device: F) -> Result<(), BleError>
    where
        F: Fn(DiscoveredWearable) + Send + Sync + 'static,
    {
        let guard = self.radio.lock().await;
        guard
            .start_scan(Arc::new(move |d: DiscoveredDevice| on_device(d.into())))
            .await?;
        info!("scan_started");
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        let guard = self.radio.lock().await;
        guard.stop_scan().await?;
        info!("scan_stopped");
        Ok(())
    }

    /// Enable or disable the audio subscription, independent of pairing.
    pub async fn set_streaming_enabled(&self, enabled: bool) -> Result<(), BleError> {
        let session = {
            let mut inner = self.inner.lock();
            inner.streaming_enabled = enabled;
            inner.linked.as_ref().map(|l| Arc::clone(&l.session))
        };
        match session {
            Some(s) => s.set_streaming(enabled).await,
            None => Ok(()),
        }
    }

    /// App-side mute. Persisted; gates decoding without touching the link.
    pub fn set_local_muted(&self, muted: bool) -> Result<(), StorageError> {
        storage::save_local_muted(self.store.as_ref(), muted)?;
        {
            let mut inner = self.inner.lock();
            inner.local_muted = muted;
            self.reconcile_audio(&mut inner);
        }
        info!(muted, "local_mute_set");
        self.publish_status();
        Ok(())
    }

    fn set_unpaired(&self) {
        {
            let mut inner = self.inner.lock();
            inner.profile = None;
            inner.pairing = PairingStatus::Unpaired;
        }
        self.publish_status();
    }

    /// Create the session for `device_id` and its event pump.
    fn attach(&self, device_id: &str) -> Arc<DeviceSession> {
        let (session, mut rx) =
            DeviceSession::new(device_id, Arc::clone(&self.radio), self.ble.clone());
        let cancel = CancellationToken::new();
        let mut state_rx = session.subscribe_state();
        let weak = self.this.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    ev = rx.recv() => {
                        let (Some(ev), Some(ctrl)) = (ev, weak.upgrade()) else { break };
                        ctrl.on_session_event(ev);
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(ctrl) = weak.upgrade() else { break };
                        ctrl.publish_status();
                    }
                }
            }
        });
        self.inner.lock().linked = Some(Linked {
            session: Arc::clone(&session),
            cancel,
        });
        session
    }

    /// Stop and drop the current session, if any.
    async fn detach(&self) {
        let linked = {
            let mut inner = self.inner.lock();
            let linked = inner.linked.take();
            inner.protocol = None;
            inner.device_muted = false;
            inner.stalled = false;
            self.reconcile_audio(&mut inner);
            linked
        };
        if let Some(linked) = linked {
            linked.cancel.cancel();
            linked.session.stop().await;
        }
        self.publish_status();
    }

    fn schedule_reconnect(&self) {
        let (session, cancel) = {
            let mut inner = self.inner.lock();
            let Some(linked) = inner.linked.as_ref() else {
                return;
            };
            let pair = (Arc::clone(&linked.session), linked.cancel.child_token());
            if inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
            pair
        };
        let policy = self.retry.clone().forever();
        let weak = self.this.clone();
        tokio::spawn(async move {
            let result = with_backoff(&policy, "ble_reconnect", &cancel, || session.start(None)).await;
            if let Some(ctrl) = weak.upgrade() {
                ctrl.inner.lock().reconnecting = false;
                ctrl.publish_status();
            }
            match result {
                Ok(()) => info!(device_id = %session.device_id(), "reconnected"),
                Err(RetryError::Cancelled) => debug!("reconnect cancelled"),
                Err(RetryError::Failed(e)) => {
                    warn!(device_id = %session.device_id(), error = %e, "reconnect abandoned")
                }
            }
        });
    }

    fn on_session_event(&self, ev: SessionEvent) {
        let mut reconnect = false;
        {
            let mut inner = self.inner.lock();
            match ev {
                SessionEvent::Ready { muted, .. } => {
                    inner.device_muted = muted == Some(true);
                    self.reconcile_audio(&mut inner);
                }
                SessionEvent::MuteChanged(muted) => {
                    info!(muted, "device_mute_changed");
                    inner.device_muted = muted;
                    self.reconcile_audio(&mut inner);
                }
                SessionEvent::BatteryChanged(pct) => debug!(pct, "battery_changed"),
                SessionEvent::StreamingStarted(info) => {
                    inner.protocol = Some(info);
                    inner.stalled = false;
                    self.reconcile_audio(&mut inner);
                }
                SessionEvent::StreamingStopped => {
                    inner.protocol = None;
                    self.reconcile_audio(&mut inner);
                }
                SessionEvent::Audio(bytes) => self.on_audio(&mut inner, &bytes),
                SessionEvent::Disconnected { requested } => {
                    inner.protocol = None;
                    inner.device_muted = false;
                    self.reconcile_audio(&mut inner);
                    reconnect = !requested && inner.profile.is_some();
                }
            }
        }
        if reconnect {
            self.schedule_reconnect();
        }
        self.publish_status();
    }

    fn on_audio(&self, inner: &mut Inner, bytes: &[u8]) {
        inner.last_frame = Instant::now();
        if inner.stalled {
            info!("audio resumed after stall");
            inner.stalled = false;
            self.reconcile_audio(inner);
        }
        if let Some(decoder) = inner.decoder.as_mut() {
            let pcm = decoder.push(bytes);
            if !pcm.is_empty() {
                self.emit(ControllerEvent::Frame(pcm));
            }
            return;
        }

        self.metrics.incr(metric_names::FRAMES_DROPPED_MUTED);
        inner.dropped_since_log += 1;
        let now = Instant::now();
        let due = inner
            .last_drop_log
            .map_or(true, |t| now.duration_since(t) >= DROP_LOG_INTERVAL);
        if due {
            debug!(
                dropped = inner.dropped_since_log,
                local_muted = inner.local_muted,
                device_muted = inner.device_muted,
                "muted frames dropped"
            );
            inner.last_drop_log = Some(now);
            inner.dropped_since_log = 0;
        }
    }

    /// Start or stop decoding so that it runs iff a subscription exists,
    /// neither side is muted and the stream has not stalled.
    fn reconcile_audio(&self, inner: &mut Inner) {
        let want = inner.protocol.is_some()
            && !inner.local_muted
            && !inner.device_muted
            && !inner.stalled;

        if want && inner.decoder.is_none() {
            let Some(info) = inner.protocol else { return };
            let warmup = Duration::from_millis(self.ble.warmup_discard_ms);
            let codec = match create_codec(info.codec, inner.opus.as_ref(), warmup) {
                Ok(c) => c,
                Err(e) => {
                    warn!(codec = %info.codec, error = %e, "cannot decode stream");
                    return;
                }
            };
            let mut decoder = FrameDecoder::new(info, codec);
            decoder.start();
            inner.decoder = Some(decoder);
            inner.last_frame = Instant::now();
            info!(codec = %info.codec, sample_rate = info.sample_rate, "audio_streaming_started");
            self.emit(ControllerEvent::StreamingStarted {
                sample_rate: info.sample_rate,
            });
            self.arm_watchdog(inner);
        } else if !want {
            if let Some(mut decoder) = inner.decoder.take() {
                if let Some(w) = inner.watchdog.take() {
                    w.cancel();
                }
                let tail = decoder.stop();
                if !tail.is_empty() {
                    self.emit(ControllerEvent::Frame(tail));
                }
                info!(
                    local_muted = inner.local_muted,
                    device_muted = inner.device_muted,
                    stalled = inner.stalled,
                    "audio_streaming_stopped"
                );
                self.emit(ControllerEvent::StreamingStopped);
            }
        }
    }

    fn arm_watchdog(&self, inner: &mut Inner) {
        if let Some(old) = inner.watchdog.take() {
            old.cancel();
        }
        let token = match inner.linked.as_ref() {
            Some(l) => l.cancel.child_token(),
            None => CancellationToken::new(),
        };
        inner.watchdog = Some(token.clone());
        let timeout = self.ble.stream_timeout();
        let weak = self.this.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(ctrl) = weak.upgrade() else { return };
                    let last = ctrl.inner.lock().last_frame;
                    last + timeout
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                let Some(ctrl) = weak.upgrade() else { return };
                if ctrl.check_watchdog(timeout) {
                    return;
                }
            }
        });
    }

    /// Returns true when the watchdog is done (fired or audio already off).
    fn check_watchdog(&self, timeout: Duration) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.decoder.is_none() {
                return true;
            }
            if inner.last_frame.elapsed() < timeout {
                return false;
            }
            warn!(timeout_ms = timeout.as_millis() as u64, "no audio frames, synthesizing stream stop");
            self.metrics.incr(metric_names::WATCHDOG_FIRED);
            inner.stalled = true;
            self.reconcile_audio(&mut inner);
        }
        self.publish_status();
        true
    }

    fn publish_status(&self) {
        let inputs = {
            let inner = self.inner.lock();
            StatusInputs {
                radio: self.radio.status(),
                pairing: inner.pairing,
                device: inner
                    .linked
                    .as_ref()
                    .map(|l| l.session.state())
                    .unwrap_or(DeviceConnectionState::Disconnected),
                local_muted: inner.local_muted,
                audio_flowing: inner.decoder.is_some(),
            }
        };
        let next = derive(&inputs);
        let changed = self.status_tx.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        });
        if changed {
            debug!(status = %next, "status_changed");
        }
    }

    fn emit(&self, ev: ControllerEvent) {
        let _ = self.events.send(ev);
    }
}
