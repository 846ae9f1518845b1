//! In-memory view of synced sessions, memories and feed, snapshotted into
//! the key-value store after every change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::update::{FeedPost, MemoryRecord, SessionRecord, Update};
use super::UpdateHandler;
use crate::error::{StorageError, SyncError};
use crate::storage::{self, KeyValueStore};

pub const KEY_SESSIONS: &str = "cache:sessions";
pub const KEY_MEMORIES: &str = "cache:memories";
pub const KEY_FEED: &str = "cache:feed";

/// Newest-first feed is capped at this many posts.
const FEED_LIMIT: usize = 200;

#[derive(Default)]
struct Tables {
    sessions: BTreeMap<String, SessionRecord>,
    memories: BTreeMap<String, MemoryRecord>,
    feed: Vec<FeedPost>,
}

pub struct LocalState {
    store: Arc<dyn KeyValueStore>,
    tables: Mutex<Tables>,
}

impl LocalState {
    /// Restore cached tables from the store.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let tables = Tables {
            sessions: storage::load_json(store.as_ref(), KEY_SESSIONS)?.unwrap_or_default(),
            memories: storage::load_json(store.as_ref(), KEY_MEMORIES)?.unwrap_or_default(),
            feed: storage::load_json(store.as_ref(), KEY_FEED)?.unwrap_or_default(),
        };
        Ok(Self {
            store,
            tables: Mutex::new(tables),
        })
    }

    pub fn session(&self, id: &str) -> Option<SessionRecord> {
        self.tables.lock().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.tables.lock().sessions.values().cloned().collect()
    }

    pub fn memory(&self, id: &str) -> Option<MemoryRecord> {
        self.tables.lock().memories.get(id).cloned()
    }

    pub fn memories(&self) -> Vec<MemoryRecord> {
        self.tables.lock().memories.values().cloned().collect()
    }

    pub fn feed(&self) -> Vec<FeedPost> {
        self.tables.lock().feed.clone()
    }

    fn apply_sync(&self, seq: u64, update: &Update) -> Result<(), StorageError> {
        let mut t = self.tables.lock();
        match update {
            Update::SessionCreated { session } | Update::SessionUpdated { session } => {
                t.sessions.insert(session.id.clone(), session.clone());
                storage::save_json(self.store.as_ref(), KEY_SESSIONS, &t.sessions)
            }
            Update::AudioAttached {
                session_id,
                audio_id,
                ..
            } => {
                let Some(s) = t.sessions.get_mut(session_id) else {
                    warn!(seq, session_id = %session_id, "audio for unknown session ignored");
                    return Ok(());
                };
                if !s.audio_ids.contains(audio_id) {
                    s.audio_ids.push(audio_id.clone());
                }
                storage::save_json(self.store.as_ref(), KEY_SESSIONS, &t.sessions)
            }
            Update::TranscriptionAttached { session_id, text } => {
                let Some(s) = t.sessions.get_mut(session_id) else {
                    warn!(seq, session_id = %session_id, "transcription for unknown session ignored");
                    return Ok(());
                };
                s.transcription = Some(text.clone());
                storage::save_json(self.store.as_ref(), KEY_SESSIONS, &t.sessions)
            }
            Update::MemoryCreated { memory } | Update::MemoryUpdated { memory } => {
                t.memories.insert(memory.id.clone(), memory.clone());
                storage::save_json(self.store.as_ref(), KEY_MEMORIES, &t.memories)
            }
            Update::FeedPost { post } => {
                t.feed.retain(|p| p.id != post.id);
                t.feed.insert(0, post.clone());
                t.feed.truncate(FEED_LIMIT);
                storage::save_json(self.store.as_ref(), KEY_FEED, &t.feed)
            }
            Update::Unknown { kind } => {
                debug!(seq, kind = %kind, "unknown update kind ignored");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl UpdateHandler for LocalState {
    async fn apply(&self, seq: u64, update: &Update) -> Result<(), SyncError> {
        self.apply_sync(seq, update)?;
        Ok(())
    }
}
