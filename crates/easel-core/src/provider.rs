use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::GatewayError;

/// Incremental text of a model response.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// An API key plus a non-secret label used for logging and rate-limit bookkeeping.
#[derive(Clone)]
pub struct Credential {
    label: String,
    secret: SecretString,
}

impl Credential {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// What a provider is asked to answer.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl ModelRequest {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            ..Self::default()
        }
    }
}

impl Default for ModelRequest {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            user_message: String::new(),
            temperature: 0.7,
            max_output_tokens: 4096,
        }
    }
}

/// A text-generation service reachable with one of several credentials and models.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider family, e.g. `gemini`.
    fn name(&self) -> &str;

    /// Open a streaming completion. Errors before the first byte are returned
    /// here; errors mid-stream arrive as stream items.
    async fn stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &ModelRequest,
    ) -> Result<TextStream, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("GEMINI_API_KEY_1", "sk-very-secret");
        let printed = format!("{c:?}");
        assert!(printed.contains("GEMINI_API_KEY_1"));
        assert!(!printed.contains("sk-very-secret"));
        assert_eq!(c.expose(), "sk-very-secret");
    }

    #[test]
    fn request_defaults() {
        let r = ModelRequest::new("sys", "user");
        assert_eq!(r.temperature, 0.7);
        assert_eq!(r.max_output_tokens, 4096);
    }
}
