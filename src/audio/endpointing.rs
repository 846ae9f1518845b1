//! Speech segmentation over a continuous PCM stream.
//!
//! ```text
//!   idle ──score > positive──▶ active ──redemption exceeded──▶ ending (cooldown)
//!    ▲                           ▲  │                              │    │
//!    │                           │  └─ too few voice frames ─▶ discard  │
//!    │                           └──────── score > positive ─────────┘    │
//!    └──────────────── cooldown exceeded: emit [from, end) ─────────────┘
//! ```
//!
//! `Segmenter` is the synchronous state machine; `EndpointingEngine` feeds it
//! frames, awaits the scorer per frame and publishes finished segments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info};

use super::vad::{frame_size, to_f32, VadScorer};
use crate::coalesce::Coalescer;
use crate::error::EndpointingError;
use crate::metrics::{metric_names, MetricsRegistry};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointingConfig {
    /// A frame scoring strictly above this is voice.
    pub positive_threshold: f32,
    /// A frame scoring strictly below this counts toward redemption.
    pub negative_threshold: f32,
    pub min_speech_frames: u32,
    pub pre_pad_ms: u64,
    pub redemption_ms: u64,
    pub cooldown_ms: u64,
    /// Idle buffer bound.
    pub truncate_ms: u64,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            positive_threshold: 0.5,
            negative_threshold: 0.35,
            min_speech_frames: 3,
            pre_pad_ms: 300,
            redemption_ms: 1_000,
            cooldown_ms: 60_000,
            truncate_ms: 10_000,
        }
    }
}

/// Config resolved to frame counts for one sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointingParams {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub positive_threshold: f32,
    pub negative_threshold: f32,
    pub min_speech_frames: u32,
    pub pre_pad_frames: u32,
    pub redemption_frames: u32,
    pub cooldown_frames: u32,
    pub truncate_frames: u32,
}

impl EndpointingParams {
    pub fn new(cfg: &EndpointingConfig, sample_rate: u32) -> Result<Self, EndpointingError> {
        let frame = frame_size(sample_rate).ok_or(EndpointingError::UnsupportedRate(sample_rate))?;
        let frames = |ms: u64| -> u32 {
            let num = ms * sample_rate as u64;
            let den = 1000 * frame as u64;
            num.div_ceil(den) as u32
        };
        Ok(Self {
            sample_rate,
            frame_size: frame,
            positive_threshold: cfg.positive_threshold,
            negative_threshold: cfg.negative_threshold,
            min_speech_frames: cfg.min_speech_frames,
            pre_pad_frames: frames(cfg.pre_pad_ms),
            redemption_frames: frames(cfg.redemption_ms),
            cooldown_frames: frames(cfg.cooldown_ms),
            truncate_frames: frames(cfg.truncate_ms),
        })
    }

    fn pre_pad_samples(&self) -> usize {
        self.pre_pad_frames as usize * self.frame_size
    }

    fn truncate_samples(&self) -> usize {
        self.truncate_frames as usize * self.frame_size
    }
}

/// One finished speech segment, mono 16-bit.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Offset of the first sample since the streaming session started.
    pub start_sample: u64,
    /// Closed by a stream stop rather than by cooldown.
    pub flushed: bool,
}

impl SpeechSegment {
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpanEvent {
    Opened { from: u64 },
    Ending { end: u64 },
    Resumed,
    Discarded { voice_frames: u32 },
    Finalized(SpeechSegment),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointingStats {
    pub frames: u64,
    pub segments: u64,
    pub discarded: u64,
    pub resumed: u64,
    pub truncated_samples: u64,
}

#[derive(Debug, Clone)]
struct Span {
    from: usize,
    redemption: u32,
    voice_frames: u32,
    resume_voice_frames: u32,
    end: Option<usize>,
    cooldown: u32,
}

pub struct Segmenter {
    params: EndpointingParams,
    buffer: Vec<i16>,
    /// Samples already scored; always a frame boundary relative to `buffer`.
    processed: usize,
    /// Samples drained from the front of `buffer` so far.
    base: u64,
    span: Option<Span>,
    stats: EndpointingStats,
}

impl Segmenter {
    pub fn new(params: EndpointingParams) -> Self {
        Self {
            params,
            buffer: Vec::new(),
            processed: 0,
            base: 0,
            span: None,
            stats: EndpointingStats::default(),
        }
    }

    pub fn params(&self) -> &EndpointingParams {
        &self.params
    }

    pub fn append(&mut self, samples: &[i16]) {
        self.buffer.extend_from_slice(samples);
    }

    /// Next unscored frame, if a full one is buffered.
    pub fn next_frame(&self) -> Option<&[i16]> {
        let end = self.processed + self.params.frame_size;
        (end <= self.buffer.len()).then(|| &self.buffer[self.processed..end])
    }

    pub fn stats(&self) -> EndpointingStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn in_speech(&self) -> bool {
        self.span.is_some()
    }

    /// Advance by one frame with its voice probability.
    pub fn apply(&mut self, prob: f32) -> Option<SpanEvent> {
        let frame_start = self.processed;
        let frame_end = frame_start + self.params.frame_size;
        if frame_end > self.buffer.len() {
            error!(
                buffered = self.buffer.len(),
                processed = self.processed,
                "score applied without a buffered frame"
            );
            debug_assert!(false, "score applied without a buffered frame");
            return None;
        }
        self.processed = frame_end;
        self.stats.frames += 1;

        let p = &self.params;
        let voice = prob > p.positive_threshold;
        let silent = prob < p.negative_threshold;

        let Some(span) = self.span.as_mut() else {
            if voice {
                let from = frame_start.saturating_sub(p.pre_pad_samples());
                self.span = Some(Span {
                    from,
                    redemption: 0,
                    voice_frames: 1,
                    resume_voice_frames: 0,
                    end: None,
                    cooldown: 0,
                });
                return Some(SpanEvent::Opened {
                    from: self.base + from as u64,
                });
            }
            self.truncate_idle();
            return None;
        };

        match span.end {
            None => {
                if voice {
                    span.voice_frames += 1;
                    span.redemption = 0;
                } else if silent {
                    span.redemption += 1;
                    if span.redemption > p.redemption_frames {
                        if span.voice_frames < p.min_speech_frames {
                            let voice_frames = span.voice_frames;
                            self.span = None;
                            self.stats.discarded += 1;
                            return Some(SpanEvent::Discarded { voice_frames });
                        }
                        span.end = Some(frame_end);
                        span.cooldown = 0;
                        return Some(SpanEvent::Ending {
                            end: self.base + frame_end as u64,
                        });
                    }
                }
                None
            }
            Some(end) => {
                debug_assert!(end <= self.buffer.len());
                if voice {
                    span.end = None;
                    span.redemption = 0;
                    span.cooldown = 0;
                    span.voice_frames += 1;
                    span.resume_voice_frames += 1;
                    self.stats.resumed += 1;
                    return Some(SpanEvent::Resumed);
                }
                span.cooldown += 1;
                if span.cooldown > p.cooldown_frames {
                    let from = span.from;
                    return Some(SpanEvent::Finalized(self.finalize(from, end, false)));
                }
                None
            }
        }
    }

    /// Close any open span at its end, or at the buffer end when none was
    /// set, regardless of length and cooldown. Clears the session.
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        let span = self.span.take()?;
        let end = span.end.unwrap_or(self.buffer.len());
        let seg = self.finalize(span.from, end, true);
        self.buffer.clear();
        self.processed = 0;
        Some(seg)
    }

    fn finalize(&mut self, from: usize, end: usize, flushed: bool) -> SpeechSegment {
        debug_assert!(from <= end && end <= self.buffer.len());
        let samples = self.buffer[from..end].to_vec();
        let start_sample = self.base + from as u64;
        self.buffer.drain(..end);
        self.processed = self.processed.saturating_sub(end);
        self.base += end as u64;
        self.span = None;
        self.stats.segments += 1;
        SpeechSegment {
            samples,
            sample_rate: self.params.sample_rate,
            start_sample,
            flushed,
        }
    }

    fn truncate_idle(&mut self) {
        if self.buffer.len() <= self.params.truncate_samples() {
            return;
        }
        let keep = self
            .params
            .pre_pad_samples()
            .max(self.buffer.len() - self.processed)
            .min(self.buffer.len());
        let drop = self.buffer.len() - keep;
        self.buffer.drain(..drop);
        self.processed -= drop;
        self.base += drop as u64;
        self.stats.truncated_samples += drop as u64;
    }
}

struct ActiveSession {
    id: u64,
    segmenter: Segmenter,
}

/// Async driver around `Segmenter`. One streaming session at a time.
pub struct EndpointingEngine {
    config: EndpointingConfig,
    scorer: AsyncMutex<Box<dyn VadScorer>>,
    session: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
    guard: Coalescer,
    segments: mpsc::UnboundedSender<SpeechSegment>,
    metrics: Arc<MetricsRegistry>,
}

impl EndpointingEngine {
    pub fn new(
        config: EndpointingConfig,
        scorer: Box<dyn VadScorer>,
        metrics: Arc<MetricsRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SpeechSegment>) {
        let (segments, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            scorer: AsyncMutex::new(scorer),
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            guard: Coalescer::new(),
            segments,
            metrics,
        });
        (engine, rx)
    }

    /// Open a session. An already open one is flushed first.
    pub async fn start(&self, sample_rate: u32) -> Result<(), EndpointingError> {
        let params = EndpointingParams::new(&self.config, sample_rate)?;
        if self.session.lock().is_some() {
            self.finish().await;
        }
        self.scorer.lock().await.start(sample_rate).await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            session = id,
            sample_rate,
            frame_size = params.frame_size,
            redemption_frames = params.redemption_frames,
            cooldown_frames = params.cooldown_frames,
            "endpointing_started"
        );
        *self.session.lock() = Some(ActiveSession {
            id,
            segmenter: Segmenter::new(params),
        });
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn stats(&self) -> Option<EndpointingStats> {
        self.session.lock().as_ref().map(|s| s.segmenter.stats())
    }

    /// Append samples and score every complete frame, in arrival order.
    pub async fn push(&self, samples: &[i16]) -> Result<(), EndpointingError> {
        match self.session.lock().as_mut() {
            Some(active) => active.segmenter.append(samples),
            None => return Err(EndpointingError::NoSession),
        }
        self.invalidate().await;
        Ok(())
    }

    /// Run scoring passes until no new samples arrived during the last one.
    /// Callers arriving while a pass runs return immediately.
    pub async fn invalidate(&self) {
        if !self.guard.begin() {
            return;
        }
        loop {
            self.score_pending().await;
            if !self.guard.complete() {
                break;
            }
        }
    }

    /// Wait for the running pass to finish.
    pub async fn settled(&self) {
        self.guard.idle().await;
    }

    /// Stream stopped: finalize any open span and close the session.
    pub async fn finish(&self) -> Option<SpeechSegment> {
        self.settled().await;
        let active = self.session.lock().take()?;
        self.scorer.lock().await.stop().await;
        let mut segmenter = active.segmenter;
        let segment = segmenter.flush();
        info!(session = active.id, stats = ?segmenter.stats(), "endpointing_finished");
        if let Some(seg) = &segment {
            self.publish(seg.clone());
        }
        segment
    }

    async fn score_pending(&self) {
        loop {
            let (id, frame) = {
                let guard = self.session.lock();
                let Some(active) = guard.as_ref() else { return };
                let Some(frame) = active.segmenter.next_frame() else {
                    return;
                };
                (active.id, to_f32(frame))
            };

            let timer = self.metrics.timer(metric_names::VAD_INFERENCE);
            let prob = self.scorer.lock().await.process(&frame).await;
            timer.finish();

            let event = {
                let mut guard = self.session.lock();
                match guard.as_mut() {
                    Some(active) if active.id == id => active.segmenter.apply(prob),
                    _ => return,
                }
            };
            if let Some(event) = event {
                self.on_event(id, event);
            }
        }
    }

    fn on_event(&self, session: u64, event: SpanEvent) {
        match event {
            SpanEvent::Opened { from } => debug!(session, from, "speech_opened"),
            SpanEvent::Ending { end } => debug!(session, end, "speech_ending"),
            SpanEvent::Resumed => {
                self.metrics.incr(metric_names::SPANS_RESUMED);
                debug!(session, "speech_resumed");
            }
            SpanEvent::Discarded { voice_frames } => {
                self.metrics.incr(metric_names::SPANS_DISCARDED);
                debug!(session, voice_frames, "speech_discarded");
            }
            SpanEvent::Finalized(seg) => self.publish(seg),
        }
    }

    fn publish(&self, seg: SpeechSegment) {
        self.metrics.incr(metric_names::SEGMENTS_EMITTED);
        self.metrics
            .record(metric_names::SEGMENT_DURATION, seg.duration().as_millis() as f64);
        info!(
            start_sample = seg.start_sample,
            samples = seg.samples.len(),
            flushed = seg.flushed,
            "segment_emitted"
        );
        let _ = self.segments.send(seg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const V: f32 = 0.9;
    const S: f32 = 0.05;

    fn small_params() -> EndpointingParams {
        EndpointingParams {
            sample_rate: 16000,
            frame_size: 4,
            positive_threshold: 0.5,
            negative_threshold: 0.35,
            min_speech_frames: 3,
            pre_pad_frames: 1,
            redemption_frames: 2,
            cooldown_frames: 3,
            truncate_frames: 10,
        }
    }

    /// Feed one frame per score; returns every event produced.
    fn run(seg: &mut Segmenter, scores: &[f32]) -> Vec<SpanEvent> {
        let mut events = Vec::new();
        for &p in scores {
            seg.append(&[1; 4]);
            assert!(seg.next_frame().is_some());
            events.extend(seg.apply(p));
        }
        events
    }

    fn finalized(events: &[SpanEvent]) -> Vec<&SpeechSegment> {
        events
            .iter()
            .filter_map(|e| match e {
                SpanEvent::Finalized(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duration_to_frames_rounds_up() {
        let cfg = EndpointingConfig {
            pre_pad_ms: 300,
            redemption_ms: 1_000,
            cooldown_ms: 60_000,
            ..Default::default()
        };
        let p = EndpointingParams::new(&cfg, 8000).unwrap();
        assert_eq!(p.frame_size, 768);
        assert_eq!(p.pre_pad_frames, 4);
        assert_eq!(p.redemption_frames, 11);
        assert_eq!(p.cooldown_frames, 625);
        let p16 = EndpointingParams::new(&cfg, 16000).unwrap();
        assert_eq!(p16.frame_size, 1536);
        assert_eq!(p16.redemption_frames, 11);
        assert_eq!(
            EndpointingParams::new(&cfg, 22050),
            Err(EndpointingError::UnsupportedRate(22050))
        );
    }

    #[test]
    fn short_blip_is_discarded_entirely() {
        let mut seg = Segmenter::new(small_params());
        let events = run(&mut seg, &[V, V, S, S, S, S, S, S, S, S]);
        assert!(finalized(&events).is_empty());
        assert!(events.contains(&SpanEvent::Discarded { voice_frames: 2 }));
        assert_eq!(seg.stats().discarded, 1);
        assert!(!seg.in_speech());
        assert_eq!(seg.flush(), None);
    }

    #[test]
    fn brief_dip_inside_redemption_stays_one_span() {
        let mut seg = Segmenter::new(small_params());
        let events = run(&mut seg, &[S, V, V, S, S, V, V, S, S, S, S, S, S, S]);
        let segs = finalized(&events);
        assert_eq!(segs.len(), 1);
        assert_eq!(seg.stats().resumed, 0);
    }

    #[test]
    fn resume_during_cooldown_extends_the_span() {
        let mut seg = Segmenter::new(small_params());
        // 0 S | 1-3 V | 4-6 S → end@28 | 7 S cooldown | 8-9 V resume | 10-12 S → end@52 | 13-16 S → emit
        let scores = [S, V, V, V, S, S, S, S, V, V, S, S, S, S, S, S, S];
        let events = run(&mut seg, &scores);
        let segs = finalized(&events);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_sample, 0);
        assert_eq!(segs[0].samples.len(), 52);
        assert!(events.contains(&SpanEvent::Resumed));
        assert_eq!(seg.stats().resumed, 1);
        // consumed samples drained, tail kept for the next frame
        assert_eq!(seg.buffered(), 68 - 52);
    }

    #[test]
    fn pre_pad_longer_than_truncation_bound_keeps_the_pad() {
        let mut seg = Segmenter::new(EndpointingParams {
            pre_pad_frames: 20,
            truncate_frames: 10,
            ..small_params()
        });
        assert!(run(&mut seg, &[S; 30]).is_empty());
        assert!((80..=84).contains(&seg.buffered()));
        assert!(seg.stats().truncated_samples > 0);

        run(&mut seg, &[V, V, V]);
        let out = seg.flush().unwrap();
        assert!(out.samples.len() >= 12);
    }

    #[test]
    fn thresholds_are_strict_with_hysteresis() {
        let mut seg = Segmenter::new(small_params());
        // exactly at the positive threshold does not open
        assert!(run(&mut seg, &[0.5]).is_empty());
        run(&mut seg, &[V, V, V]);
        // between thresholds neither redeems nor counts as voice
        let events = run(&mut seg, &[0.4; 20]);
        assert!(events.is_empty());
        assert!(seg.in_speech());
    }

    #[test]
    fn flush_closes_open_span_at_buffer_end() {
        let mut seg = Segmenter::new(small_params());
        run(&mut seg, &[S, V, V]);
        seg.append(&[7, 7]);
        let out = seg.flush().unwrap();
        assert!(out.flushed);
        assert_eq!(out.start_sample, 0);
        assert_eq!(out.samples.len(), 14);
        assert_eq!(seg.buffered(), 0);
    }

    #[test]
    fn flush_uses_pending_end() {
        let mut seg = Segmenter::new(small_params());
        run(&mut seg, &[V, V, V, S, S, S, S]);
        let out = seg.flush().unwrap();
        assert_eq!(out.samples.len(), 24);
    }

    #[test]
    fn idle_buffer_is_truncated_to_pre_pad() {
        let mut seg = Segmenter::new(small_params());
        run(&mut seg, &[S; 11]);
        assert_eq!(seg.buffered(), 4);
        assert_eq!(seg.stats().truncated_samples, 40);
        let events = run(&mut seg, &[V]);
        assert_eq!(events, vec![SpanEvent::Opened { from: 40 }]);
    }

    #[test]
    fn active_span_is_never_truncated() {
        let mut seg = Segmenter::new(small_params());
        run(&mut seg, &[V, V, V]);
        run(&mut seg, &[0.4; 30]);
        assert_eq!(seg.buffered(), 33 * 4);
    }

    /// Voice iff the frame has any non-trivial sample.
    struct Loudness;

    #[async_trait]
    impl VadScorer for Loudness {
        async fn start(&mut self, _sample_rate: u32) {}
        async fn process(&mut self, frame: &[f32]) -> f32 {
            if frame.iter().any(|s| s.abs() > 0.01) {
                0.9
            } else {
                0.05
            }
        }
        async fn stop(&mut self) {}
    }

    fn tone(n: usize) -> Vec<i16> {
        (0..n).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect()
    }

    #[tokio::test]
    async fn tone_then_silence_at_8k_yields_one_segment() {
        let cfg = EndpointingConfig {
            pre_pad_ms: 300,
            redemption_ms: 1_000,
            cooldown_ms: 60_000,
            ..Default::default()
        };
        let metrics = Arc::new(MetricsRegistry::new());
        let (engine, mut rx) = EndpointingEngine::new(cfg, Box::new(Loudness), metrics.clone());
        engine.start(8000).await.unwrap();

        let frame = 768;
        engine.push(&vec![0; 10 * frame]).await.unwrap();
        engine.push(&tone(3200)).await.unwrap(); // 400 ms
        engine.push(&vec![0; 16_000]).await.unwrap(); // 2 s
        assert!(rx.try_recv().is_err(), "cooldown has not elapsed yet");

        engine.push(&vec![0; 480_000]).await.unwrap(); // 60 s
        let seg = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        let pre_pad = 4 * frame;
        assert_eq!(seg.start_sample, (10 * frame - pre_pad) as u64);
        // tone touches frames 10..=14, redemption (11 frames) exceeded on frame 26
        assert_eq!(seg.samples.len(), 27 * frame - (10 * frame - pre_pad));
        assert!(seg.samples.len() >= pre_pad + 3200 + 8000);
        assert!(!seg.flushed);

        assert_eq!(engine.finish().await, None);
        assert_eq!(metrics.counter(metric_names::SEGMENTS_EMITTED), 1);
    }

    #[tokio::test]
    async fn finish_mid_speech_flushes() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (engine, mut rx) =
            EndpointingEngine::new(EndpointingConfig::default(), Box::new(Loudness), metrics);
        engine.start(16000).await.unwrap();
        engine.push(&tone(1536)).await.unwrap();
        engine.push(&tone(100)).await.unwrap();
        let seg = engine.finish().await.unwrap();
        assert!(seg.flushed);
        assert_eq!(seg.samples.len(), 1636);
        assert_eq!(rx.try_recv().unwrap(), seg);
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn push_without_session_fails_fast() {
        let (engine, _rx) = EndpointingEngine::new(
            EndpointingConfig::default(),
            Box::new(Loudness),
            Arc::new(MetricsRegistry::new()),
        );
        assert_eq!(engine.push(&[0; 10]).await, Err(EndpointingError::NoSession));
    }

    #[tokio::test]
    async fn concurrent_pushes_are_scored_in_order() {
        let (engine, _rx) = EndpointingEngine::new(
            EndpointingConfig::default(),
            Box::new(Loudness),
            Arc::new(MetricsRegistry::new()),
        );
        engine.start(16000).await.unwrap();
        let a = {
            let e = engine.clone();
            tokio::spawn(async move { e.push(&vec![0; 1536 * 3]).await })
        };
        let b = {
            let e = engine.clone();
            tokio::spawn(async move { e.push(&vec![0; 1536 * 2]).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        engine.invalidate().await;
        engine.settled().await;
        assert_eq!(engine.stats().unwrap().frames, 5);
    }
}
