//! Capture pipeline: controller audio events → endpointing → segments.
//!
//! One `EndpointingEngine` lives per streaming session. It is created on
//! `StreamingStarted`, fed frames in arrival order, and finished on
//! `StreamingStopped` so an open span is flushed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::endpointing::{EndpointingConfig, EndpointingEngine, SpeechSegment};
use crate::audio::vad::VadScorer;
use crate::controller::ControllerEvent;
use crate::metrics::MetricsRegistry;
use crate::upload::UploadWorker;

/// Builds a fresh scorer for each streaming session.
pub type ScorerFactory = Arc<dyn Fn() -> Box<dyn VadScorer> + Send + Sync>;

struct Active {
    engine: Arc<EndpointingEngine>,
    segments: mpsc::UnboundedReceiver<SpeechSegment>,
}

pub struct CapturePipeline {
    config: EndpointingConfig,
    scorers: ScorerFactory,
    metrics: Arc<MetricsRegistry>,
    out: mpsc::UnboundedSender<SpeechSegment>,
    active: Option<Active>,
}

impl CapturePipeline {
    pub fn new(
        config: EndpointingConfig,
        scorers: ScorerFactory,
        metrics: Arc<MetricsRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<SpeechSegment>) {
        let (out, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                scorers,
                metrics,
                out,
                active: None,
            },
            rx,
        )
    }

    /// Consume controller events until the channel closes or `cancel` fires.
    /// Events already queued at cancel are still handled, and a session
    /// still open at exit is finished first.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ControllerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        while let Ok(event) = events.try_recv() {
            self.handle(event).await;
        }
        self.close().await;
        info!("capture pipeline stopped");
    }

    pub async fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::StreamingStarted { sample_rate } => {
                self.close().await;
                let (engine, segments) = EndpointingEngine::new(
                    self.config.clone(),
                    (self.scorers)(),
                    Arc::clone(&self.metrics),
                );
                if let Err(e) = engine.start(sample_rate).await {
                    warn!(sample_rate, error = %e, "endpointing unavailable for stream");
                    return;
                }
                self.active = Some(Active { engine, segments });
            }
            ControllerEvent::Frame(pcm) => {
                let Some(active) = self.active.as_ref() else {
                    debug!(samples = pcm.len(), "frame outside a streaming session dropped");
                    return;
                };
                if let Err(e) = active.engine.push(&pcm).await {
                    warn!(error = %e, "frame rejected by endpointing");
                }
                self.forward();
            }
            ControllerEvent::StreamingStopped => self.close().await,
        }
    }

    fn forward(&mut self) {
        let Some(active) = self.active.as_mut() else { return };
        while let Ok(seg) = active.segments.try_recv() {
            let _ = self.out.send(seg);
        }
    }

    async fn close(&mut self) {
        let Some(active) = self.active.as_ref() else { return };
        active.engine.finish().await;
        self.forward();
        self.active = None;
    }
}

/// Running capture pipeline and the upload worker draining it.
pub struct CaptureWorkers {
    pipeline: JoinHandle<()>,
    uploader: JoinHandle<()>,
    pipeline_cancel: CancellationToken,
    upload_cancel: CancellationToken,
}

impl CaptureWorkers {
    pub fn spawn(
        pipeline: CapturePipeline,
        segments: mpsc::UnboundedReceiver<SpeechSegment>,
        events: mpsc::UnboundedReceiver<ControllerEvent>,
        uploader: Arc<UploadWorker>,
    ) -> Self {
        let pipeline_cancel = CancellationToken::new();
        let upload_cancel = CancellationToken::new();
        Self {
            pipeline: tokio::spawn(pipeline.run(events, pipeline_cancel.clone())),
            uploader: uploader.spawn(segments, upload_cancel.clone()),
            pipeline_cancel,
            upload_cancel,
        }
    }

    /// Stop capture, flushing any open span, then give the uploader up to
    /// `drain` to send what is left before cancelling it.
    pub async fn shutdown(self, drain: Duration) {
        self.pipeline_cancel.cancel();
        if let Err(e) = self.pipeline.await {
            warn!(error = %e, "capture pipeline task failed");
        }
        // the pipeline dropped its sender, so the uploader exits once drained
        let mut uploader = self.uploader;
        if tokio::time::timeout(drain, &mut uploader).await.is_err() {
            warn!(drain_ms = drain.as_millis() as u64, "segment uploads still pending, abandoning");
            self.upload_cancel.cancel();
            let _ = uploader.await;
        }
    }
}
