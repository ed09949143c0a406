use std::time::Duration;

/// Typed error hierarchy for model gateway operations.
/// Every variant is a per-candidate failure; only `Exhausted` ends a session.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("all providers failed after {attempts} attempts")]
    Exhausted { attempts: usize },
}

impl GatewayError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
                | Self::Timeout(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after, .. } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// Classify an HTTP status and body into the appropriate error variant.
    ///
    /// A body mentioning a rate or quota signal is treated as rate limiting
    /// regardless of status; some providers report quota exhaustion as 400/403.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || mentions_rate_limit(&body) {
            return Self::RateLimited {
                retry_after: parse_retry_hint(&body),
                message: body,
            };
        }
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 => Self::InvalidRequest(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// True when an error message carries a rate or quota signal.
pub fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "rate limit",
        "rate-limit",
        "rate_limit",
        "ratelimit",
        "quota",
        "429",
        "resource_exhausted",
        "too many requests",
    ]
    .iter()
    .any(|signal| lower.contains(signal))
}

/// Extract a retry delay from provider error text.
///
/// Understands `retry in 12.5s`, `retry after 30 seconds` and
/// `"retryDelay": "41s"`.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    for marker in ["retry in", "retry after", "\"retrydelay\":"] {
        let Some(start) = lower.find(marker) else {
            continue;
        };
        let rest = lower[start + marker.len()..].trim_start().trim_start_matches('"');
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(secs) = number.parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                return Some(Duration::from_millis((secs * 1000.0).ceil() as u64));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limit() {
        let e = GatewayError::from_status(429, "slow down".into());
        assert!(e.is_rate_limit());
        assert!(e.is_retryable());
    }

    #[test]
    fn quota_message_is_rate_limit_even_on_403() {
        let e = GatewayError::from_status(403, "Quota exceeded for project".into());
        assert!(e.is_rate_limit());
    }

    #[test]
    fn generate_is_not_a_rate_signal() {
        assert!(!mentions_rate_limit("failed to generate content"));
        assert!(mentions_rate_limit("Rate limit reached for model"));
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            GatewayError::from_status(401, "nope".into()),
            GatewayError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            GatewayError::from_status(400, "bad".into()),
            GatewayError::InvalidRequest(_)
        ));
        assert!(matches!(
            GatewayError::from_status(503, "down".into()),
            GatewayError::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn retry_hint_formats() {
        assert_eq!(
            parse_retry_hint("Please retry in 12.5s."),
            Some(Duration::from_millis(12_500))
        );
        assert_eq!(
            parse_retry_hint("Retry after 30 seconds"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_hint(r#"{"@type":"RetryInfo","retryDelay": "41s"}"#),
            Some(Duration::from_secs(41))
        );
        assert_eq!(parse_retry_hint("try again later"), None);
    }

    #[test]
    fn rate_limit_carries_hint() {
        let e = GatewayError::from_status(429, "quota hit, retry in 7s".into());
        assert_eq!(e.suggested_delay(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GatewayError::Cancelled.error_kind(), "cancelled");
        assert_eq!(GatewayError::Exhausted { attempts: 3 }.error_kind(), "exhausted");
    }

    #[test]
    fn exhausted_message() {
        let e = GatewayError::Exhausted { attempts: 4 };
        assert!(e.to_string().starts_with("all providers failed"));
    }
}
