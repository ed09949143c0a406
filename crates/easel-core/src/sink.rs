use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actions::{ActionDescriptor, ActionStatus};
use crate::events::SessionEvent;
use crate::ids::{ActionId, SessionId};
use crate::session::SessionState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink write failed: {0}")]
    Write(String),
}

/// Extra session fields written alongside a state change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions_count: Option<usize>,
}

impl SessionUpdate {
    pub fn provider(provider_model: impl Into<String>) -> Self {
        Self {
            provider_model: Some(provider_model.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Persistence hooks for session output.
///
/// Failures are reported to the caller, which logs them and carries on; a
/// broken sink never fails a session.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn append_event(&self, event: &SessionEvent) -> Result<(), SinkError>;

    async fn append_action(
        &self,
        session_id: &SessionId,
        action: &ActionDescriptor,
    ) -> Result<(), SinkError>;

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
        update: &SessionUpdate,
    ) -> Result<(), SinkError>;

    async fn update_action_status(
        &self,
        session_id: &SessionId,
        action_id: &ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_skips_empty_fields() {
        let json =
            serde_json::to_value(SessionUpdate::provider("gemini:gemini-2.0-flash")).unwrap();
        assert_eq!(json, serde_json::json!({"providerModel": "gemini:gemini-2.0-flash"}));
    }
}
