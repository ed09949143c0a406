//! Credential, model and provider rotation.
//!
//! Candidates are tried in order: each provider route in turn, each of its
//! credentials, each of its models. Candidates under a rate-limit expiry are
//! skipped without a request. Any failure before a candidate's first fragment
//! moves on to the next candidate; the caller only sees an error once every
//! candidate has been exhausted. Errors after the first fragment belong to the
//! caller's stream.

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use easel_core::clock::Clock;
use easel_core::errors::GatewayError;
use easel_core::provider::{Credential, ModelProvider, ModelRequest, TextStream};

use crate::ratelimit::{credential_key, model_key, RateLimitStore};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// One provider with its own credential and model lists, in priority order.
pub struct ProviderRoute {
    pub provider: Arc<dyn ModelProvider>,
    pub credentials: Vec<Credential>,
    pub models: Vec<String>,
}

impl ProviderRoute {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        credentials: Vec<Credential>,
        models: Vec<String>,
    ) -> Self {
        Self {
            provider,
            credentials,
            models,
        }
    }
}

/// A stream opened on a concrete candidate.
pub struct ActiveStream {
    pub stream: TextStream,
    pub provider: String,
    pub model: String,
    pub credential: String,
    pub attempts: usize,
}

impl ActiveStream {
    /// `provider:model`, as reported in completion events.
    pub fn provider_model(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStream")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Availability summary for one route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteHealth {
    pub provider: String,
    pub credentials_available: usize,
    pub credentials_limited: usize,
    pub models_available: usize,
    pub models_limited: usize,
}

pub struct ModelGateway {
    routes: Vec<ProviderRoute>,
    limits: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    rate_limit_window: Duration,
}

impl ModelGateway {
    pub fn new(
        routes: Vec<ProviderRoute>,
        limits: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            routes,
            limits,
            clock,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_rate_limit_window(mut self, window: Duration) -> Self {
        self.rate_limit_window = window;
        self
    }

    pub fn routes(&self) -> &[ProviderRoute] {
        &self.routes
    }

    /// Open a response stream on the first candidate that accepts the request.
    #[instrument(skip_all, fields(routes = self.routes.len()))]
    pub async fn open_stream(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ActiveStream, GatewayError> {
        let mut attempts = 0usize;

        for route in &self.routes {
            let provider = route.provider.name();
            for credential in &route.credentials {
                let cred_key = credential_key(provider, credential.label());
                if !self.limits.is_available(&cred_key, self.clock.now_ms()) {
                    debug!(
                        provider,
                        credential = credential.label(),
                        "skipping rate-limited credential"
                    );
                    continue;
                }

                for model in &route.models {
                    let now = self.clock.now_ms();
                    if !self.limits.is_available(&model_key(provider, model), now) {
                        debug!(provider, model = %model, "skipping rate-limited model");
                        continue;
                    }
                    if cancel.is_cancelled() {
                        return Err(GatewayError::Cancelled);
                    }

                    attempts += 1;
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        r = tokio::time::timeout(
                            self.request_timeout,
                            open_first(route.provider.as_ref(), credential, model, request),
                        ) => r,
                    };

                    match attempt {
                        Ok(Ok(stream)) => {
                            info!(
                                provider,
                                model = %model,
                                credential = credential.label(),
                                attempts,
                                "stream opened"
                            );
                            return Ok(ActiveStream {
                                stream,
                                provider: provider.to_string(),
                                model: model.clone(),
                                credential: credential.label().to_string(),
                                attempts,
                            });
                        }
                        Ok(Err(e)) if e.is_rate_limit() => {
                            self.record_rate_limit(
                                provider,
                                credential.label(),
                                model,
                                e.suggested_delay(),
                            );
                            warn!(
                                provider,
                                model = %model,
                                credential = credential.label(),
                                error = %e,
                                "rate limited, rotating credential"
                            );
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!(
                                provider,
                                model = %model,
                                error = %e,
                                kind = e.error_kind(),
                                "candidate failed"
                            );
                        }
                        Err(_) => {
                            warn!(
                                provider,
                                model = %model,
                                timeout_ms = self.request_timeout.as_millis() as u64,
                                "candidate timed out"
                            );
                        }
                    }
                }
            }
            debug!(provider, "provider exhausted, falling back");
        }

        error!(attempts, "all providers failed");
        Err(GatewayError::Exhausted { attempts })
    }

    /// Mark a credential and, independently, a model as unavailable.
    ///
    /// Uses the provider's retry hint when present, else the fallback window.
    pub fn record_rate_limit(
        &self,
        provider: &str,
        credential: &str,
        model: &str,
        retry_after: Option<Duration>,
    ) {
        let window = retry_after.unwrap_or(self.rate_limit_window);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let until = self.clock.now_ms().saturating_add(window_ms);
        self.limits.set_expiry(&credential_key(provider, credential), until);
        self.limits.set_expiry(&model_key(provider, model), until);
    }

    pub fn health(&self) -> Vec<RouteHealth> {
        let now = self.clock.now_ms();
        self.routes
            .iter()
            .map(|route| {
                let provider = route.provider.name();
                let credentials_available = route
                    .credentials
                    .iter()
                    .filter(|c| self.limits.is_available(&credential_key(provider, c.label()), now))
                    .count();
                let models_available = route
                    .models
                    .iter()
                    .filter(|m| self.limits.is_available(&model_key(provider, m), now))
                    .count();
                RouteHealth {
                    provider: provider.to_string(),
                    credentials_available,
                    credentials_limited: route.credentials.len() - credentials_available,
                    models_available,
                    models_limited: route.models.len() - models_available,
                }
            })
            .collect()
    }
}

/// Open a stream and wait for its first fragment.
///
/// A candidate counts as accepted only once it has produced output, so an
/// error or idle timeout before that (including an error payload embedded in
/// the body) is a failure of this candidate alone.
async fn open_first(
    provider: &dyn ModelProvider,
    credential: &Credential,
    model: &str,
    request: &ModelRequest,
) -> Result<TextStream, GatewayError> {
    let mut body = provider.stream(credential, model, request).await?;
    match body.next().await {
        Some(Ok(first)) => Ok(Box::pin(stream::once(async move { Ok(first) }).chain(body))),
        Some(Err(e)) => Err(e),
        None => Ok(Box::pin(stream::empty())),
    }
}
