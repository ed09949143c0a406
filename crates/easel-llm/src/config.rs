use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use easel_core::clock::Clock;
use easel_core::errors::GatewayError;
use easel_core::provider::Credential;

use crate::gateway::{
    ModelGateway, ProviderRoute, DEFAULT_RATE_LIMIT_WINDOW, DEFAULT_REQUEST_TIMEOUT,
};
use crate::gemini::{GeminiProvider, GEMINI_BASE_URL};
use crate::openrouter::{OpenRouterProvider, OPENROUTER_BASE_URL};
use crate::ratelimit::RateLimitStore;
use crate::sse::SSE_IDLE_TIMEOUT;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_GEMINI_MODELS: &[&str] = &[
    "gemini-2.5-flash-preview-05-20",
    "gemini-2.0-flash",
    "gemini-1.5-flash",
];
pub const DEFAULT_OPENROUTER_MODELS: &[&str] = &[
    "google/gemini-2.0-flash-exp:free",
    "google/gemini-exp-1206:free",
];

const GEMINI_KEY_VARS: &[&str] = &[
    "GEMINI_API_KEY",
    "GEMINI_API_KEY_1",
    "GEMINI_API_KEY_2",
    "GEMINI_API_KEY_3",
    "GEMINI_API_KEY_4",
    "GEMINI_API_KEY_5",
];
const OPENROUTER_KEY_VARS: &[&str] = &[
    "OPENROUTER_API_KEY",
    "OPENROUTER_API_KEY_1",
    "OPENROUTER_API_KEY_2",
    "OPENROUTER_API_KEY_3",
];

#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub base_url: String,
    pub models: Vec<String>,
    pub credentials: Vec<Credential>,
}

impl ProviderSettings {
    fn new(base_url: &str, models: &[&str]) -> Self {
        Self {
            base_url: base_url.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            credentials: Vec::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.credentials.is_empty() && !self.models.is_empty()
    }
}

/// Provider gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub rate_limit_window: Duration,
    pub gemini: ProviderSettings,
    pub openrouter: ProviderSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            gemini: ProviderSettings::new(GEMINI_BASE_URL, DEFAULT_GEMINI_MODELS),
            openrouter: ProviderSettings::new(OPENROUTER_BASE_URL, DEFAULT_OPENROUTER_MODELS),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// Empty values are ignored and identical keys are kept once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.gemini.credentials = collect_credentials(&lookup, GEMINI_KEY_VARS);
        config.openrouter.credentials = collect_credentials(&lookup, OPENROUTER_KEY_VARS);
        if let Some(models) = lookup("EASEL_GEMINI_MODELS").and_then(|v| split_list(&v)) {
            config.gemini.models = models;
        }
        if let Some(models) = lookup("EASEL_OPENROUTER_MODELS").and_then(|v| split_list(&v)) {
            config.openrouter.models = models;
        }
        config
    }

    /// Primary provider first, fallback second. Unconfigured providers are left out.
    pub fn build(
        &self,
        limits: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<ModelGateway, GatewayError> {
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;

        let mut routes = Vec::new();
        if self.gemini.is_configured() {
            let provider = GeminiProvider::new(client.clone())
                .with_base_url(&self.gemini.base_url)
                .with_idle_timeout(self.idle_timeout);
            routes.push(ProviderRoute::new(
                Arc::new(provider),
                self.gemini.credentials.clone(),
                self.gemini.models.clone(),
            ));
        }
        if self.openrouter.is_configured() {
            let provider = OpenRouterProvider::new(client)
                .with_base_url(&self.openrouter.base_url)
                .with_idle_timeout(self.idle_timeout);
            routes.push(ProviderRoute::new(
                Arc::new(provider),
                self.openrouter.credentials.clone(),
                self.openrouter.models.clone(),
            ));
        }

        if routes.is_empty() {
            warn!("no provider credentials configured");
        } else {
            info!(
                providers = routes.len(),
                credentials = routes.iter().map(|r| r.credentials.len()).sum::<usize>(),
                "gateway configured"
            );
        }

        Ok(ModelGateway::new(routes, limits, clock)
            .with_request_timeout(self.request_timeout)
            .with_rate_limit_window(self.rate_limit_window))
    }
}

fn collect_credentials(lookup: &impl Fn(&str) -> Option<String>, vars: &[&str]) -> Vec<Credential> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for var in vars {
        let Some(value) = lookup(var).map(|v| v.trim().to_string()) else {
            continue;
        };
        if value.is_empty() || seen.contains(&value) {
            continue;
        }
        seen.push(value.clone());
        out.push(Credential::new(*var, value));
    }
    out
}

fn split_list(value: &str) -> Option<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::InMemoryRateLimits;
    use easel_core::clock::ManualClock;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn collects_numbered_keys_without_duplicates() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "a"),
            ("GEMINI_API_KEY_1", "a"),
            ("GEMINI_API_KEY_2", "b"),
            ("GEMINI_API_KEY_3", "  "),
        ]));
        let labels: Vec<&str> = config.gemini.credentials.iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["GEMINI_API_KEY", "GEMINI_API_KEY_2"]);
        assert!(config.openrouter.credentials.is_empty());
    }

    #[test]
    fn model_lists_override_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[("EASEL_GEMINI_MODELS", "a, b,,c")]));
        assert_eq!(config.gemini.models, vec!["a", "b", "c"]);
        assert_eq!(config.openrouter.models.len(), DEFAULT_OPENROUTER_MODELS.len());
    }

    #[test]
    fn build_skips_unconfigured_providers() {
        let config = GatewayConfig::from_lookup(lookup(&[("OPENROUTER_API_KEY", "or")]));
        let gateway = config
            .build(Arc::new(InMemoryRateLimits::new()), Arc::new(ManualClock::new(0)))
            .unwrap();
        let names: Vec<&str> = gateway.routes().iter().map(|r| r.provider.name()).collect();
        assert_eq!(names, vec!["openrouter"]);
    }
}
