//! Gapless, ordered application of server updates.
//!
//! Two delivery paths feed one watermark:
//!
//! ```text
//!   push stream ──(seq, update?)──▶ queue ──contiguous drain──▶ handler
//!                                      ▲                          ▲
//!   maxKnown > applied ──▶ get_diff(applied) ─── page in order ───┘
//! ```
//!
//! `applied` only moves forward and is persisted after every applied update.
//! Passes are single-flight through a [`Coalescer`].

pub mod local;
pub mod sse;
pub mod transport;
pub mod update;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coalesce::Coalescer;
use crate::error::SyncError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::retry::{with_backoff, RetryError, RetryPolicy};
use crate::storage::{self, KeyValueStore};

pub use transport::{Diff, HttpUpdateTransport, UpdateTransport};
pub use update::Update;

/// Receives updates in seq order, exactly once each.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn apply(&self, seq: u64, update: &Update) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub applied_seq: Option<u64>,
    pub max_known_seq: u64,
}

#[derive(Default)]
struct Inner {
    applied: Option<u64>,
    max_known: u64,
    queue: BTreeMap<u64, Update>,
}

impl Inner {
    fn drop_stale(&mut self) {
        let Some(applied) = self.applied else { return };
        while let Some((&seq, _)) = self.queue.first_key_value() {
            if seq > applied {
                break;
            }
            self.queue.pop_first();
            debug!(seq, applied, "stale queued update dropped");
        }
    }
}

impl From<RetryError<SyncError>> for SyncError {
    fn from(e: RetryError<SyncError>) -> Self {
        match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Failed(e) => e,
        }
    }
}

pub struct UpdateSyncEngine {
    transport: Arc<dyn UpdateTransport>,
    handler: Arc<dyn UpdateHandler>,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<MetricsRegistry>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    guard: Coalescer,
    inner: Mutex<Inner>,
}

impl UpdateSyncEngine {
    /// Build the engine, restoring the persisted watermark.
    pub fn new(
        transport: Arc<dyn UpdateTransport>,
        handler: Arc<dyn UpdateHandler>,
        store: Arc<dyn KeyValueStore>,
        metrics: Arc<MetricsRegistry>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let applied = storage::load_applied_seq(store.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "stored watermark unreadable, bootstrapping");
            None
        });
        info!(?applied, "update sync restored");
        Arc::new(Self {
            transport,
            handler,
            store,
            metrics,
            retry,
            cancel: CancellationToken::new(),
            guard: Coalescer::new(),
            inner: Mutex::new(Inner {
                applied,
                max_known: applied.unwrap_or(0),
                queue: BTreeMap::new(),
            }),
        })
    }

    pub fn state(&self) -> SyncState {
        let inner = self.inner.lock();
        SyncState {
            applied_seq: inner.applied,
            max_known_seq: inner.max_known,
        }
    }

    /// Offer one push delivery. `None` is a heartbeat carrying the server's
    /// latest seq.
    pub async fn push(&self, seq: u64, update: Option<Update>) {
        {
            let mut inner = self.inner.lock();
            inner.max_known = inner.max_known.max(seq);
            match (update, inner.applied) {
                (Some(_), Some(applied)) if seq <= applied => {
                    debug!(seq, applied, "replayed update dropped");
                }
                (Some(u), _) => {
                    inner.queue.insert(seq, u);
                }
                (None, _) => {}
            }
        }
        self.invalidate().await;
    }

    /// Run sync passes until no new work arrived during the last one.
    /// Callers arriving while a pass runs return immediately.
    pub async fn invalidate(&self) {
        if !self.guard.begin() {
            return;
        }
        loop {
            if let Err(e) = self.pass().await {
                match e {
                    SyncError::Cancelled => debug!("sync pass cancelled"),
                    e => warn!(error = %e, "sync pass failed"),
                }
            }
            if !self.guard.complete() {
                break;
            }
        }
    }

    /// Wait for the running pass to finish.
    pub async fn settled(&self) {
        self.guard.idle().await;
    }

    /// Abort in-flight pulls and their backoff sleeps.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn pass(&self) -> Result<(), SyncError> {
        if self.inner.lock().applied.is_none() {
            self.bootstrap().await?;
        }
        self.drain_queue().await?;

        let mut more = false;
        loop {
            let (applied, max_known) = {
                let inner = self.inner.lock();
                (inner.applied.unwrap_or(0), inner.max_known)
            };
            if !more && applied >= max_known {
                return Ok(());
            }

            let timer = self.metrics.timer(metric_names::SYNC_DIFF);
            let diff = with_backoff(&self.retry, "updates_get_diff", &self.cancel, || {
                self.transport.get_diff(applied)
            })
            .await?;
            timer.finish();
            debug!(
                after = applied,
                seq = diff.seq,
                has_more = diff.has_more,
                count = diff.updates.len(),
                "diff pulled"
            );

            for (seq, update) in &diff.updates {
                let current = self.inner.lock().applied.unwrap_or(0);
                if *seq <= current {
                    continue;
                }
                self.apply_one(*seq, update).await?;
            }

            let advanced = {
                let mut inner = self.inner.lock();
                let current = inner.applied.unwrap_or(0);
                let next = current.max(diff.seq);
                inner.max_known = inner.max_known.max(diff.seq);
                inner.applied = Some(next);
                inner.drop_stale();
                (next != current).then_some(next)
            };
            if let Some(next) = advanced {
                // jump over entries that failed validation
                storage::save_applied_seq(self.store.as_ref(), next)?;
            }

            self.drain_queue().await?;

            more = diff.has_more;
            if more && diff.seq <= applied {
                warn!(after = applied, seq = diff.seq, "diff made no progress, stopping");
                return Ok(());
            }
        }
    }

    async fn bootstrap(&self) -> Result<(), SyncError> {
        let seq = with_backoff(&self.retry, "updates_get_seq", &self.cancel, || {
            self.transport.get_seq()
        })
        .await?;
        storage::save_applied_seq(self.store.as_ref(), seq)?;
        let mut inner = self.inner.lock();
        inner.applied = Some(seq);
        inner.max_known = inner.max_known.max(seq);
        inner.drop_stale();
        info!(seq, "update sync bootstrapped at server seq");
        Ok(())
    }

    /// Apply queued push updates while they continue the watermark.
    async fn drain_queue(&self) -> Result<(), SyncError> {
        loop {
            let next = {
                let mut inner = self.inner.lock();
                inner.drop_stale();
                let want = inner.applied.unwrap_or(0) + 1;
                match inner.queue.first_key_value() {
                    Some((&seq, _)) if seq == want => inner.queue.pop_first(),
                    Some((&seq, _)) => {
                        debug!(seq, want, "gap in pushed updates");
                        None
                    }
                    None => None,
                }
            };
            let Some((seq, update)) = next else {
                return Ok(());
            };
            if let Err(e) = self.apply_one(seq, &update).await {
                self.inner.lock().queue.insert(seq, update);
                return Err(e);
            }
        }
    }

    async fn apply_one(&self, seq: u64, update: &Update) -> Result<(), SyncError> {
        self.handler.apply(seq, update).await?;
        storage::save_applied_seq(self.store.as_ref(), seq)?;
        self.inner.lock().applied = Some(seq);
        self.metrics.incr(metric_names::UPDATES_APPLIED);
        debug!(seq, kind = update.kind(), "update applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::update::FeedPost;
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::HashSet;

    fn post(seq: u64) -> Update {
        Update::FeedPost {
            post: FeedPost {
                id: format!("p{seq}"),
                title: None,
                body: format!("post {seq}"),
                created_at: None,
            },
        }
    }

    /// Server history; `None` entries fail validation at the transport.
    struct ScriptedTransport {
        head: u64,
        log: BTreeMap<u64, Option<Update>>,
        page: usize,
        diffs: Mutex<Vec<u64>>,
    }

    impl ScriptedTransport {
        fn new(n: u64) -> Self {
            Self {
                head: n,
                log: (1..=n).map(|s| (s, Some(post(s)))).collect(),
                page: 100,
                diffs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UpdateTransport for ScriptedTransport {
        async fn get_seq(&self) -> Result<u64, SyncError> {
            Ok(self.head)
        }

        async fn get_diff(&self, after: u64) -> Result<Diff, SyncError> {
            self.diffs.lock().push(after);
            let page: Vec<_> = self.log.range(after + 1..).take(self.page).collect();
            let seq = page.last().map(|(s, _)| **s).unwrap_or(after);
            Ok(Diff {
                seq,
                has_more: seq < self.head,
                updates: page
                    .into_iter()
                    .filter_map(|(s, u)| u.clone().map(|u| (*s, u)))
                    .collect(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<u64>>,
        fail_once: Mutex<HashSet<u64>>,
    }

    #[async_trait]
    impl UpdateHandler for Recorder {
        async fn apply(&self, seq: u64, _update: &Update) -> Result<(), SyncError> {
            if self.fail_once.lock().remove(&seq) {
                return Err(SyncError::Malformed(format!("handler rejected {seq}")));
            }
            self.applied.lock().push(seq);
            Ok(())
        }
    }

    fn engine(
        transport: ScriptedTransport,
        applied: Option<u64>,
    ) -> (Arc<UpdateSyncEngine>, Arc<ScriptedTransport>, Arc<Recorder>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        if let Some(seq) = applied {
            storage::save_applied_seq(store.as_ref(), seq).unwrap();
        }
        let transport = Arc::new(transport);
        let recorder = Arc::new(Recorder::default());
        let engine = UpdateSyncEngine::new(
            transport.clone(),
            recorder.clone(),
            store.clone(),
            Arc::new(MetricsRegistry::new()),
            RetryPolicy::default(),
        );
        (engine, transport, recorder, store)
    }

    #[tokio::test]
    async fn first_run_bootstraps_without_replay() {
        let (engine, transport, recorder, store) = engine(ScriptedTransport::new(10), None);
        engine.invalidate().await;
        assert_eq!(engine.state().applied_seq, Some(10));
        assert!(transport.diffs.lock().is_empty());
        assert!(recorder.applied.lock().is_empty());
        assert_eq!(storage::load_applied_seq(store.as_ref()).unwrap(), Some(10));
    }

    #[tokio::test]
    async fn interleaved_push_and_pull_apply_each_seq_once() {
        let (engine, _transport, recorder, store) = engine(ScriptedTransport::new(8), Some(0));
        // push arrives out of order with a gap at 4, then a heartbeat for 8
        for seq in [3, 1, 2, 5] {
            engine.push(seq, Some(post(seq))).await;
        }
        engine.push(8, None).await;
        engine.push(6, Some(post(6))).await;
        engine.settled().await;

        assert_eq!(*recorder.applied.lock(), (1..=8).collect::<Vec<_>>());
        assert_eq!(engine.state().applied_seq, Some(8));
        assert_eq!(storage::load_applied_seq(store.as_ref()).unwrap(), Some(8));
    }

    #[tokio::test]
    async fn replayed_push_is_a_noop() {
        let (engine, transport, recorder, _store) = engine(ScriptedTransport::new(3), Some(3));
        engine.push(2, Some(post(2))).await;
        engine.push(3, Some(post(3))).await;
        engine.settled().await;
        assert!(recorder.applied.lock().is_empty());
        assert!(transport.diffs.lock().is_empty());
        assert_eq!(engine.state().applied_seq, Some(3));
    }

    #[tokio::test]
    async fn gap_pulls_diff_from_watermark() {
        let (engine, transport, recorder, _store) = engine(ScriptedTransport::new(5), Some(2));
        engine.push(5, Some(post(5))).await;
        engine.settled().await;
        assert_eq!(*transport.diffs.lock(), vec![2]);
        assert_eq!(*recorder.applied.lock(), vec![3, 4, 5]);

        // late duplicates of diff-covered seqs
        engine.push(4, Some(post(4))).await;
        engine.push(5, Some(post(5))).await;
        assert_eq!(*recorder.applied.lock(), vec![3, 4, 5]);
        assert_eq!(*transport.diffs.lock(), vec![2]);
    }

    #[tokio::test]
    async fn malformed_diff_entries_do_not_stall_the_watermark() {
        let mut t = ScriptedTransport::new(5);
        t.log.insert(3, None);
        let (engine, _transport, recorder, store) = engine(t, Some(0));
        engine.push(5, None).await;
        assert_eq!(*recorder.applied.lock(), vec![1, 2, 4, 5]);
        assert_eq!(engine.state().applied_seq, Some(5));
        assert_eq!(storage::load_applied_seq(store.as_ref()).unwrap(), Some(5));
    }

    #[tokio::test]
    async fn paged_diffs_repeat_while_more_remain() {
        let mut t = ScriptedTransport::new(5);
        t.page = 2;
        let (engine, transport, recorder, _store) = engine(t, Some(0));
        engine.push(5, None).await;
        assert_eq!(*transport.diffs.lock(), vec![0, 2, 4]);
        assert_eq!(recorder.applied.lock().len(), 5);
    }

    #[tokio::test]
    async fn handler_failure_keeps_watermark_and_retries_next_pass() {
        let (engine, _transport, recorder, _store) = engine(ScriptedTransport::new(3), Some(0));
        recorder.fail_once.lock().insert(2);
        engine.push(1, Some(post(1))).await;
        engine.push(2, Some(post(2))).await;
        assert_eq!(engine.state().applied_seq, Some(1));

        engine.push(3, Some(post(3))).await;
        assert_eq!(*recorder.applied.lock(), vec![1, 2, 3]);
        assert_eq!(engine.state().applied_seq, Some(3));
    }
}
