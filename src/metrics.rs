//! In-process observability: latency histograms and monotonic counters.
//! Histograms keep the last 1024 samples and report p50/p95/p99.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Records elapsed microseconds under `name` when finished.
pub struct Timer {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl Timer {
    pub fn finish(self) -> f64 {
        let us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, us);
        us
    }
}

struct Window {
    values: Vec<f64>,
    next: usize,
    filled: usize,
}

impl Window {
    fn with_capacity(cap: usize) -> Self {
        Self {
            values: vec![0.0; cap],
            next: 0,
            filled: 0,
        }
    }

    fn push(&mut self, v: f64) {
        let cap = self.values.len();
        self.values[self.next] = v;
        self.next = (self.next + 1) % cap;
        self.filled = (self.filled + 1).min(cap);
    }

    fn quantile(&self, p: f64) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let mut sorted = self.values[..self.filled].to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((p / 100.0) * (self.filled as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.filled - 1)]
    }
}

#[derive(Default)]
struct Tables {
    histograms: HashMap<&'static str, Window>,
    counters: HashMap<&'static str, u64>,
}

pub struct MetricsRegistry {
    tables: Mutex<Tables>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            window: 1024,
        }
    }

    pub fn record(&self, name: &'static str, value: f64) {
        let window = self.window;
        self.tables
            .lock()
            .histograms
            .entry(name)
            .or_insert_with(|| Window::with_capacity(window))
            .push(value);
    }

    pub fn incr(&self, name: &'static str) {
        *self.tables.lock().counters.entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.tables.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn timer(self: &Arc<Self>, name: &'static str) -> Timer {
        Timer {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let tables = self.tables.lock();
        tables
            .histograms
            .iter()
            .map(|(&name, w)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50: w.quantile(50.0),
                        p95: w.quantile(95.0),
                        p99: w.quantile(99.0),
                        count: w.filled,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

pub mod metric_names {
    pub const BLE_CONNECT: &str = "t_ble_connect_us";
    pub const VAD_INFERENCE: &str = "t_vad_inference_us";
    pub const SEGMENT_DURATION: &str = "segment_duration_ms";
    pub const SEGMENT_UPLOAD: &str = "t_segment_upload_us";
    pub const SYNC_DIFF: &str = "t_sync_diff_us";

    pub const FRAMES_DROPPED_MUTED: &str = "frames_dropped_muted";
    pub const SEGMENTS_EMITTED: &str = "segments_emitted";
    pub const SPANS_DISCARDED: &str = "spans_discarded";
    pub const SPANS_RESUMED: &str = "spans_resumed";
    pub const UPDATES_APPLIED: &str = "updates_applied";
    pub const UPDATES_MALFORMED: &str = "updates_malformed";
    pub const WATCHDOG_FIRED: &str = "stream_watchdog_fired";
}
