use easel_core::errors::GatewayError;
use easel_core::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Text carried by the session's `error` event.
    pub fn session_message(&self) -> String {
        match self {
            Self::Cancelled | Self::Gateway(GatewayError::Cancelled) => "cancelled".to_string(),
            Self::Gateway(GatewayError::Exhausted { .. }) => "all providers failed".to_string(),
            Self::Gateway(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}
