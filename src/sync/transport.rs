//! Pull side of the update protocol, plus the HTTP client that also opens
//! the push stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::update::{parse_update, Update};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics::{metric_names, MetricsRegistry};

/// One page of history after some seq.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Authoritative high-water mark of this page, including entries that
    /// failed validation.
    pub seq: u64,
    pub has_more: bool,
    pub updates: Vec<(u64, Update)>,
}

#[async_trait]
pub trait UpdateTransport: Send + Sync {
    async fn get_seq(&self) -> Result<u64, SyncError>;
    async fn get_diff(&self, after: u64) -> Result<Diff, SyncError>;
}

#[derive(Debug, Deserialize)]
struct SeqResponse {
    seq: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawDiff {
    pub seq: u64,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub updates: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEntry {
    pub seq: u64,
    #[serde(default)]
    pub data: Value,
}

/// Validate a diff page. Entries that fail validation are logged, counted
/// and dropped; `seq` still covers them.
pub(crate) fn decode_diff(raw: RawDiff, metrics: &MetricsRegistry) -> Diff {
    let mut updates = Vec::with_capacity(raw.updates.len());
    for entry in raw.updates {
        match parse_update(&entry.data) {
            Ok(u) => updates.push((entry.seq, u)),
            Err(reason) => {
                metrics.incr(metric_names::UPDATES_MALFORMED);
                warn!(seq = entry.seq, reason = %reason, "malformed diff entry skipped");
            }
        }
    }
    Diff {
        seq: raw.seq,
        has_more: raw.has_more,
        updates,
    }
}

/// Bearer-authenticated HTTP client for `/v1/updates/*`.
pub struct HttpUpdateTransport {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    metrics: Arc<MetricsRegistry>,
}

impl HttpUpdateTransport {
    pub fn new(config: &SyncConfig, metrics: Arc<MetricsRegistry>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        // the push stream is long-lived; only bound the connect phase
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            stream_http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            metrics,
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.header("Authorization", format!("Bearer {t}")),
            None => req,
        }
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Open the SSE push stream.
    pub async fn open_push(&self) -> Result<reqwest::Response, SyncError> {
        let req = self
            .stream_http
            .get(format!("{}/v1/updates/stream", self.base_url))
            .header("Accept", "text/event-stream");
        let resp = self.authed(req).send().await?;
        Self::checked(resp).await
    }
}

#[async_trait]
impl UpdateTransport for HttpUpdateTransport {
    async fn get_seq(&self) -> Result<u64, SyncError> {
        let req = self.http.get(format!("{}/v1/updates/seq", self.base_url));
        let resp = Self::checked(self.authed(req).send().await?).await?;
        let body: SeqResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(format!("seq: {e}")))?;
        Ok(body.seq)
    }

    async fn get_diff(&self, after: u64) -> Result<Diff, SyncError> {
        let req = self
            .http
            .get(format!("{}/v1/updates/diff", self.base_url))
            .query(&[("after", after)]);
        let resp = Self::checked(self.authed(req).send().await?).await?;
        let raw: RawDiff = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(format!("diff: {e}")))?;
        Ok(decode_diff(raw, &self.metrics))
    }
}
