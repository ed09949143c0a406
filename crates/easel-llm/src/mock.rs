use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use easel_core::errors::GatewayError;
use easel_core::provider::{Credential, ModelProvider, ModelRequest, TextStream};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these text fragments, then end.
    Fragments(Vec<String>),
    /// Yield these fragments, then fail mid-stream.
    FailAfter(Vec<String>, GatewayError),
    /// Return an error from the `stream()` call itself.
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: the whole text as a single fragment.
    pub fn text(text: &str) -> Self {
        Self::Fragments(vec![text.to_string()])
    }

    pub fn fragments(parts: &[&str]) -> Self {
        Self::Fragments(parts.iter().map(|s| s.to_string()).collect())
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::Error(GatewayError::RateLimited {
            retry_after,
            message: "rate limit exceeded".into(),
        })
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One recorded `stream()` call.
#[derive(Clone, Debug, PartialEq)]
pub struct MockCall {
    pub credential: String,
    pub model: String,
    pub request: ModelRequest,
}

/// Provider that returns pre-programmed responses in call order and records
/// every attempt.
pub struct MockProvider {
    name: String,
    responses: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::named("mock", responses)
    }

    pub fn named(name: &str, responses: Vec<MockResponse>) -> Self {
        Self {
            name: name.to_string(),
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &ModelRequest,
    ) -> Result<TextStream, GatewayError> {
        self.calls.lock().push(MockCall {
            credential: credential.label().to_string(),
            model: model.to_string(),
            request: request.clone(),
        });

        let Some(mut current) = self.responses.lock().pop_front() else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {}",
                self.call_count()
            )));
        };

        loop {
            match current {
                MockResponse::Fragments(parts) => {
                    return Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))));
                }
                MockResponse::FailAfter(parts, error) => {
                    let items = parts.into_iter().map(Ok).chain(std::iter::once(Err(error)));
                    return Ok(Box::pin(stream::iter(items)));
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
