//! Server-pushed domain events.
//!
//! Updates arrive as loosely-typed JSON objects tagged by `type`. They are
//! validated here, at the transport boundary, into closed variants. A
//! well-formed object with a `type` this client does not know becomes
//! [`Update::Unknown`]; anything else is malformed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub audio_ids: Vec<String>,
    #[serde(default)]
    pub transcription: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Update {
    SessionCreated {
        session: SessionRecord,
    },
    SessionUpdated {
        session: SessionRecord,
    },
    #[serde(rename_all = "camelCase")]
    AudioAttached {
        session_id: String,
        audio_id: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    TranscriptionAttached {
        session_id: String,
        text: String,
    },
    MemoryCreated {
        memory: MemoryRecord,
    },
    MemoryUpdated {
        memory: MemoryRecord,
    },
    FeedPost {
        post: FeedPost,
    },
    /// Tagged with a `type` this build does not understand.
    #[serde(skip)]
    Unknown { kind: String },
}

const KNOWN_KINDS: &[&str] = &[
    "session-created",
    "session-updated",
    "audio-attached",
    "transcription-attached",
    "memory-created",
    "memory-updated",
    "feed-post",
];

impl Update {
    pub fn kind(&self) -> &str {
        match self {
            Update::SessionCreated { .. } => "session-created",
            Update::SessionUpdated { .. } => "session-updated",
            Update::AudioAttached { .. } => "audio-attached",
            Update::TranscriptionAttached { .. } => "transcription-attached",
            Update::MemoryCreated { .. } => "memory-created",
            Update::MemoryUpdated { .. } => "memory-updated",
            Update::FeedPost { .. } => "feed-post",
            Update::Unknown { kind } => kind,
        }
    }
}

/// Validate one update payload.
pub fn parse_update(value: &Value) -> Result<Update, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing `type` tag".to_string())?;
    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Update::Unknown {
            kind: kind.to_string(),
        });
    }
    Update::deserialize(value).map_err(|e| format!("{kind}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_variants() {
        let u = parse_update(&json!({
            "type": "audio-attached",
            "sessionId": "s1",
            "audioId": "a1"
        }))
        .unwrap();
        assert_eq!(
            u,
            Update::AudioAttached {
                session_id: "s1".into(),
                audio_id: "a1".into(),
                duration_ms: None
            }
        );

        let u = parse_update(&json!({
            "type": "feed-post",
            "post": {"id": "p1", "body": "hello", "createdAt": "2024-01-01"}
        }))
        .unwrap();
        assert_eq!(u.kind(), "feed-post");
    }

    #[test]
    fn unknown_kind_is_explicit() {
        let u = parse_update(&json!({"type": "poll-created", "id": 4})).unwrap();
        assert_eq!(
            u,
            Update::Unknown {
                kind: "poll-created".into()
            }
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(parse_update(&json!({"session": {"id": "x"}})).is_err());
        assert!(parse_update(&json!({"type": "memory-created", "memory": {"id": 3}})).is_err());
        assert!(parse_update(&json!("session-created")).is_err());
    }
}
