pub mod config;
pub mod gateway;
pub mod gemini;
pub mod openrouter;
pub mod ratelimit;
pub mod sse;

pub mod mock;

pub use config::GatewayConfig;
pub use gateway::{ActiveStream, ModelGateway, ProviderRoute, RouteHealth};
pub use gemini::GeminiProvider;
pub use mock::{MockProvider, MockResponse};
pub use openrouter::OpenRouterProvider;
pub use ratelimit::{InMemoryRateLimits, RateLimitStore};
