//! Finished speech segments → WAV → compressor → backend.
//!
//! Uploads are retried under the umbrella backoff. Every attempt carries the
//! same `Idempotency-Key` (blake3 of the compressed bytes) so the server can
//! drop duplicates from retried requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::endpointing::SpeechSegment;
use crate::audio::wav::encode_wav;
use crate::config::SyncConfig;
use crate::error::UploadError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::retry::{with_backoff, RetryError, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedAudio {
    /// Short format tag, e.g. `wav`.
    pub format: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait AudioCompressor: Send + Sync {
    async fn compress(&self, wav: Vec<u8>) -> Result<CompressedAudio, UploadError>;
}

/// Uploads the WAV container as is.
pub struct PassthroughCompressor;

#[async_trait]
impl AudioCompressor for PassthroughCompressor {
    async fn compress(&self, wav: Vec<u8>) -> Result<CompressedAudio, UploadError> {
        Ok(CompressedAudio {
            format: "wav".into(),
            data: wav,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SegmentUpload {
    pub idempotency_key: String,
    pub format: String,
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub start_sample: u64,
    pub duration_ms: u64,
}

#[async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, segment: &SegmentUpload) -> Result<(), UploadError>;
}

pub fn idempotency_key(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// `POST {base}/v1/segments` with the audio as the body.
pub struct HttpSegmentUploader {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSegmentUploader {
    pub fn new(config: &SyncConfig) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }
}

fn content_type(format: &str) -> String {
    match format {
        "wav" => "audio/wav".into(),
        other => format!("audio/{other}"),
    }
}

#[async_trait]
impl SegmentUploader for HttpSegmentUploader {
    async fn upload(&self, segment: &SegmentUpload) -> Result<(), UploadError> {
        let mut req = self
            .http
            .post(format!("{}/v1/segments", self.base_url))
            .header("Content-Type", content_type(&segment.format))
            .header("Idempotency-Key", &segment.idempotency_key)
            .header("X-Sample-Rate", segment.sample_rate.to_string())
            .header("X-Start-Sample", segment.start_sample.to_string())
            .header("X-Duration-Ms", segment.duration_ms.to_string())
            .body(segment.data.clone());
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {t}"));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(UploadError::Status {
                status: status.as_u16(),
            })
        }
    }
}

pub struct UploadWorker {
    compressor: Arc<dyn AudioCompressor>,
    uploader: Arc<dyn SegmentUploader>,
    retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl UploadWorker {
    pub fn new(
        compressor: Arc<dyn AudioCompressor>,
        uploader: Arc<dyn SegmentUploader>,
        retry: RetryPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            compressor,
            uploader,
            retry,
            metrics,
        }
    }

    pub async fn prepare(&self, segment: &SpeechSegment) -> Result<SegmentUpload, UploadError> {
        let wav = encode_wav(&segment.samples, segment.sample_rate);
        let compressed = self.compressor.compress(wav).await?;
        Ok(SegmentUpload {
            idempotency_key: idempotency_key(&compressed.data),
            format: compressed.format,
            data: compressed.data,
            sample_rate: segment.sample_rate,
            start_sample: segment.start_sample,
            duration_ms: segment.duration().as_millis() as u64,
        })
    }

    pub async fn upload_segment(
        &self,
        segment: &SpeechSegment,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<UploadError>> {
        let upload = self.prepare(segment).await.map_err(RetryError::Failed)?;
        let timer = self.metrics.timer(metric_names::SEGMENT_UPLOAD);
        with_backoff(&self.retry, "segment_upload", cancel, || {
            self.uploader.upload(&upload)
        })
        .await?;
        timer.finish();
        info!(
            key = %upload.idempotency_key,
            format = %upload.format,
            bytes = upload.data.len(),
            duration_ms = upload.duration_ms,
            "segment_uploaded"
        );
        Ok(())
    }

    /// Upload segments one at a time, in emission order, until the channel
    /// closes or `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        mut segments: mpsc::UnboundedReceiver<SpeechSegment>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let segment = tokio::select! {
                    _ = cancel.cancelled() => break,
                    s = segments.recv() => match s {
                        Some(s) => s,
                        None => break,
                    },
                };
                match self.upload_segment(&segment, &cancel).await {
                    Ok(()) => {}
                    Err(RetryError::Cancelled) => break,
                    Err(RetryError::Failed(e)) => {
                        warn!(error = %e, start_sample = segment.start_sample, "segment upload abandoned")
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn segment() -> SpeechSegment {
        SpeechSegment {
            samples: vec![100; 1600],
            sample_rate: 16000,
            start_sample: 320,
            flushed: false,
        }
    }

    struct Flaky {
        failures: Mutex<Vec<u16>>,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SegmentUploader for Flaky {
        async fn upload(&self, segment: &SegmentUpload) -> Result<(), UploadError> {
            self.keys.lock().push(segment.idempotency_key.clone());
            match self.failures.lock().pop() {
                Some(status) => Err(UploadError::Status { status }),
                None => Ok(()),
            }
        }
    }

    fn worker(failures: Vec<u16>) -> (UploadWorker, Arc<Flaky>) {
        let flaky = Arc::new(Flaky {
            failures: Mutex::new(failures),
            keys: Mutex::new(Vec::new()),
        });
        let w = UploadWorker::new(
            Arc::new(PassthroughCompressor),
            flaky.clone(),
            RetryPolicy::default(),
            Arc::new(MetricsRegistry::new()),
        );
        (w, flaky)
    }

    #[tokio::test]
    async fn prepared_upload_is_wav_with_stable_key() {
        let (w, _) = worker(vec![]);
        let a = w.prepare(&segment()).await.unwrap();
        let b = w.prepare(&segment()).await.unwrap();
        assert_eq!(a.format, "wav");
        assert_eq!(&a.data[..4], b"RIFF");
        assert_eq!(a.data.len(), 44 + 3200);
        assert_eq!(a.duration_ms, 100);
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.idempotency_key.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_the_same_key() {
        let (w, flaky) = worker(vec![503, 429]);
        w.upload_segment(&segment(), &CancellationToken::new())
            .await
            .unwrap();
        let keys = flaky.keys.lock();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k == &keys[0]));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (w, flaky) = worker(vec![400]);
        let err = w
            .upload_segment(&segment(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::Failed(UploadError::Status { status: 400 })
        ));
        assert_eq!(flaky.keys.lock().len(), 1);
    }

    #[tokio::test]
    async fn worker_drains_channel_in_order() {
        let (w, flaky) = worker(vec![]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(w).spawn(rx, CancellationToken::new());
        let mut second = segment();
        second.samples = vec![7; 800];
        tx.send(segment()).unwrap();
        tx.send(second).unwrap();
        drop(tx);
        handle.await.unwrap();
        let keys = flaky.keys.lock();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }
}
