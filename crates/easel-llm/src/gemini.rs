use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use easel_core::errors::GatewayError;
use easel_core::provider::{Credential, ModelProvider, ModelRequest, TextStream};

use crate::sse::{self, SSE_IDLE_TIMEOUT};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Generative Language API, streamed as SSE.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    idle_timeout: Duration,
}

impl GeminiProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: GEMINI_BASE_URL.to_string(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    fn body(request: &ModelRequest) -> Value {
        json!({
            "systemInstruction": {
                "parts": [{"text": request.system_prompt}]
            },
            "contents": [{
                "role": "user",
                "parts": [{"text": request.user_message}]
            }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens,
                "responseMimeType": "application/json"
            }
        })
    }
}

/// Text of the first candidate: `candidates[0].content.parts[*].text`.
pub fn extract_text(value: &Value) -> Option<String> {
    let parts = value
        .pointer("/candidates/0/content/parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(
        skip(self, credential, request),
        fields(model = %model, credential = %credential.label())
    )]
    async fn stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &ModelRequest,
    ) -> Result<TextStream, GatewayError> {
        debug!("opening gemini stream");
        let req = self
            .client
            .post(self.url(model))
            .header("x-goog-api-key", credential.expose())
            .header("content-type", "application/json")
            .json(&Self::body(request));
        sse::open_text_stream(req, extract_text, self.idle_timeout).await
    }
}
