//! wearlink: BLE wearable audio capture, speech endpointing and update sync.
//! Main library: module wiring and the runtime that spawns the workers.

pub mod audio;
pub mod ble;
pub mod coalesce;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod storage;
pub mod sync;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::Config;
pub use controller::{ControllerEvent, DiscoveredWearable, WearableController};
pub use device::{DeviceProfile, Vendor};
pub use error::{PairingError, StartupError};
pub use status::WearableStatus;

use ble::radio::BleRadio;
use ble::BluetoothTransport;
use metrics::MetricsRegistry;
use pipeline::{CapturePipeline, CaptureWorkers, ScorerFactory};
use storage::{KeyValueStore, SqliteStore};
use sync::local::LocalState;
use sync::{HttpUpdateTransport, UpdateSyncEngine};
use upload::{HttpSegmentUploader, PassthroughCompressor, UploadWorker};

/// Time the uploader gets at shutdown to send segments still queued.
const UPLOAD_DRAIN: Duration = Duration::from_secs(10);

/// Running client: radio, controller, capture pipeline, uploader and sync.
pub struct Wearlink {
    pub controller: Arc<WearableController>,
    pub sync: Arc<UpdateSyncEngine>,
    pub local: Arc<LocalState>,
    pub metrics: Arc<MetricsRegistry>,
    radio: Arc<BleRadio>,
    capture: Mutex<Option<CaptureWorkers>>,
    cancel: CancellationToken,
}

impl Wearlink {
    /// Open storage, bring up the radio and restore the paired device, then
    /// spawn the capture, upload and sync workers.
    pub async fn start(
        config: Config,
        transport: Arc<dyn BluetoothTransport>,
        scorers: ScorerFactory,
    ) -> Result<Self, StartupError> {
        info!(db = %config.storage.db_path.display(), api = %config.sync.base_url, "wearlink starting");

        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&config.storage.db_path)?);

        let radio = BleRadio::new(transport, Arc::clone(&metrics));
        let (controller, events) = WearableController::new(
            Arc::clone(&radio),
            Arc::clone(&store),
            &config,
            Arc::clone(&metrics),
        );

        // capture: controller → endpointing → upload
        let (pipeline, segments) =
            CapturePipeline::new(config.endpointing.clone(), scorers, Arc::clone(&metrics));
        let uploader = Arc::new(UploadWorker::new(
            Arc::new(PassthroughCompressor),
            Arc::new(HttpSegmentUploader::new(&config.sync)?),
            config.retry.clone(),
            Arc::clone(&metrics),
        ));
        let capture = CaptureWorkers::spawn(pipeline, segments, events, uploader);

        // sync: push stream + catch-up pull
        let local = Arc::new(LocalState::load(Arc::clone(&store))?);
        let update_transport = Arc::new(HttpUpdateTransport::new(&config.sync, Arc::clone(&metrics))?);
        let sync = UpdateSyncEngine::new(
            update_transport.clone(),
            local.clone(),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.retry.clone(),
        );
        tokio::spawn(sync::sse::run_push_loop(
            update_transport,
            Arc::clone(&sync),
            config.sync.clone(),
            Arc::clone(&metrics),
            cancel.child_token(),
        ));
        let initial = Arc::clone(&sync);
        tokio::spawn(async move { initial.invalidate().await });

        let status = controller.init().await;
        info!(status = %status, "wearlink started");

        Ok(Self {
            controller,
            sync,
            local,
            metrics,
            radio,
            capture: Mutex::new(Some(capture)),
            cancel,
        })
    }

    /// Stop workers, drop the device link (keeping the pairing) and release
    /// the radio. Speech still open is flushed and uploaded first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.sync.shutdown();
        self.controller.shutdown().await;
        let capture = self.capture.lock().take();
        if let Some(capture) = capture {
            capture.shutdown(UPLOAD_DRAIN).await;
        }
        self.radio.destroy().await;
        info!("wearlink stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::vad::{EnergyScorer, VadScorer};
    use crate::ble::mock::{FakeDevice, FakeTransport};

    #[tokio::test]
    async fn start_pair_restart_restores_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("wearlink.db");
        // nothing listens here; sync just keeps backing off
        config.sync.base_url = "http://127.0.0.1:9".into();
        let scorers: ScorerFactory =
            Arc::new(|| Box::new(EnergyScorer::default()) as Box<dyn VadScorer>);

        let transport = FakeTransport::new();
        transport.add_device(FakeDevice::super_device("dev", "Bubble", 0));

        let app = Wearlink::start(config.clone(), transport.clone(), scorers.clone())
            .await
            .unwrap();
        assert_eq!(app.controller.status(), WearableStatus::Unpaired);
        let profile = app.controller.try_pair_device("dev").await.unwrap();
        assert_eq!(profile.vendor, Vendor::Bubble);
        app.shutdown().await;

        let app = Wearlink::start(config, transport, scorers).await.unwrap();
        assert_eq!(app.controller.profile(), Some(profile));
        app.shutdown().await;
    }
}
