//! Push side: SSE framing and the reconnecting stream loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::HttpUpdateTransport;
use super::update::{parse_update, Update};
use super::UpdateSyncEngine;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics::{metric_names, MetricsRegistry};

/// Splits a byte stream into SSE `data:` payloads. Multi-line events are
/// joined with `\n`; a blank line ends an event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // chunks may split a UTF-8 sequence; decode whole lines only
        self.line_buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // comments (`:`), `event:`, `id:` and `retry:` carry nothing we use
        }
        events
    }
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    seq: u64,
    #[serde(default)]
    data: Value,
}

/// Decode one push event into `(seq, update)`. An update that fails
/// validation degrades to a heartbeat so the gap is still noticed.
pub fn parse_push_frame(payload: &str, metrics: &MetricsRegistry) -> Option<(u64, Option<Update>)> {
    let frame: PushFrame = match serde_json::from_str(payload) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "push frame without seq ignored");
            return None;
        }
    };
    if frame.data.is_null() {
        return Some((frame.seq, None));
    }
    match parse_update(&frame.data) {
        Ok(u) => Some((frame.seq, Some(u))),
        Err(reason) => {
            metrics.incr(metric_names::UPDATES_MALFORMED);
            warn!(seq = frame.seq, reason = %reason, "malformed push update, treating as heartbeat");
            Some((frame.seq, None))
        }
    }
}

fn reconnect_delay(config: &SyncConfig) -> Duration {
    let min = config.push_reconnect_min_ms;
    let max = config.push_reconnect_max_ms.max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Hold the push stream open until cancelled, feeding every frame to the
/// engine. Transport errors reconnect after a random delay.
pub async fn run_push_loop(
    transport: Arc<HttpUpdateTransport>,
    engine: Arc<UpdateSyncEngine>,
    config: SyncConfig,
    metrics: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) {
    loop {
        match stream_once(&transport, &engine, &metrics, &cancel).await {
            Ok(()) => info!("update stream closed by server"),
            Err(SyncError::Cancelled) => return,
            Err(e) => warn!(error = %e, "update stream failed"),
        }
        // catch up on anything missed while disconnected
        engine.invalidate().await;
        let delay = reconnect_delay(&config);
        debug!(delay_ms = delay.as_millis() as u64, "update stream reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn stream_once(
    transport: &HttpUpdateTransport,
    engine: &UpdateSyncEngine,
    metrics: &MetricsRegistry,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let response = tokio::select! {
        r = transport.open_push() => r?,
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
    };
    info!("update stream connected");
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = tokio::select! {
        c = stream.next() => c,
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
    } {
        let bytes = chunk?;
        for payload in decoder.push(&bytes) {
            if let Some((seq, update)) = parse_push_frame(&payload, metrics) {
                engine.push(seq, update).await;
            }
        }
    }
    Ok(())
}
