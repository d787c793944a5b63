use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ActorId, ConversationId, Role};

/// Frame tag for per-conversation unseen-count pushes.
pub const UNSEEN_COUNT_UPDATE: &str = "UNSEEN_COUNT_UPDATE";

/// Wire shape of every inbound notification frame: `{"type": ..., "payload": ...}`.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnseenCountUpdate {
    pub conversation_id: ConversationId,
    pub count: u64,
}

/// Inbound frames this client interprets. Tags it does not recognize land in
/// `Unknown` so newer backends stay compatible with older clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationFrame {
    UnseenCountUpdate(UnseenCountUpdate),
    Unknown { tag: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed notification frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for frame {tag}: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

impl NotificationFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        if raw.tag == UNSEEN_COUNT_UPDATE {
            let update =
                serde_json::from_value(raw.payload).map_err(|source| FrameError::Payload {
                    tag: raw.tag,
                    source,
                })?;
            Ok(NotificationFrame::UnseenCountUpdate(update))
        } else {
            Ok(NotificationFrame::Unknown { tag: raw.tag })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub id: ActorId,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub unseen_count: u64,
}
