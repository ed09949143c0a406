use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use easel_core::errors::GatewayError;
use easel_core::provider::{Credential, ModelProvider, ModelRequest, TextStream};

use crate::sse::{self, SSE_IDLE_TIMEOUT};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai";

/// OpenAI-compatible chat completions via OpenRouter.
pub struct OpenRouterProvider {
    client: Client,
    base_url: String,
    idle_timeout: Duration,
    app_title: String,
}

impl OpenRouterProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: OPENROUTER_BASE_URL.to_string(),
            idle_timeout: SSE_IDLE_TIMEOUT,
            app_title: "easel".to_string(),
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

    fn body(model: &str, request: &ModelRequest) -> Value {
        json!({
            "model": model,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_message}
            ]
        })
    }
}

/// `choices[0].delta.content`.
pub fn extract_text(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ModelProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
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
        debug!("opening openrouter stream");
        let req = self
            .client
            .post(format!("{}/api/v1/chat/completions", self.base_url))
            .bearer_auth(credential.expose())
            .header("X-Title", &self.app_title)
            .header("content-type", "application/json")
            .json(&Self::body(model, request));
        sse::open_text_stream(req, extract_text, self.idle_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extract_delta_content() {
        let v = json!({"choices": [{"delta": {"content": "abc"}}]});
        assert_eq!(extract_text(&v).as_deref(), Some("abc"));
        assert_eq!(extract_text(&json!({"choices": [{"delta": {}}]})), None);
    }

    #[tokio::test]
    async fn streams_until_done_sentinel() {
        let server = MockServer::start().await;
        let body = concat!(
            ": OPENROUTER PROCESSING\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"message\\\":\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"ok\\\"}\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer or-key"))
            .and(body_partial_json(
                json!({"model": "google/gemini-2.0-flash-exp:free", "stream": true}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenRouterProvider::new(Client::new()).with_base_url(server.uri());
        let stream = provider
            .stream(
                &Credential::new("OPENROUTER_API_KEY", "or-key"),
                "google/gemini-2.0-flash-exp:free",
                &ModelRequest::new("s", "u"),
            )
            .await
            .unwrap();
        let text: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(text.concat(), "{\"message\":\"ok\"}");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let provider = OpenRouterProvider::new(Client::new()).with_base_url(server.uri());
        let result = provider
            .stream(&Credential::new("k", "k"), "m", &ModelRequest::default())
            .await;
        match result {
            Err(e) => assert!(e.is_retryable() && !e.is_rate_limit(), "got {e:?}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
