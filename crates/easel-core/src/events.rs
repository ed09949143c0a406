use serde::{Deserialize, Serialize};

use crate::actions::ActionDescriptor;
use crate::ids::{EventId, SessionId};
use crate::messages::Role;

/// Payload of a session event, tagged by `type` with the body under `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventData {
    SessionStart {
        session_id: SessionId,
    },
    Chunk {
        text: String,
    },
    Message {
        content: String,
        is_partial: bool,
        role: Role,
    },
    Action(ActionDescriptor),
    Complete {
        success: bool,
        provider_model: Option<String>,
        actions_count: usize,
    },
    Error {
        message: String,
    },
}

impl EventData {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::Chunk { .. } => "chunk",
            Self::Message { .. } => "message",
            Self::Action(_) => "action",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// One entry of a session's event stream.
///
/// Sequence numbers are strictly increasing within a session, starting at 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: EventId,
    pub session_id: SessionId,
    pub timestamp_ms: i64,
    pub sequence: u64,
    #[serde(flatten)]
    pub data: EventData,
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        self.data.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.data, EventData::Complete { .. } | EventData::Error { .. })
    }

    /// Render as a server-sent-events frame.
    pub fn to_sse(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_type(),
            body
        )
    }
}

/// SSE comment frame that keeps idle connections open.
pub fn heartbeat_frame(timestamp_ms: i64) -> String {
    format!(": heartbeat {timestamp_ms}\n\n")
}
