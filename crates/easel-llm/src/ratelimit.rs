//! Expiry records for rate-limited credentials and models.
//!
//! Records are shared by every session in the process. Readers and writers
//! may race; the worst outcome is a slightly stale skip decision.

use dashmap::DashMap;

/// Keyed expiry timestamps (unix ms). An absent or expired key is available.
pub trait RateLimitStore: Send + Sync {
    fn expiry(&self, key: &str) -> Option<i64>;

    fn set_expiry(&self, key: &str, until_ms: i64);

    fn clear(&self, key: &str);

    fn is_available(&self, key: &str, now_ms: i64) -> bool {
        self.expiry(key).map_or(true, |until| until <= now_ms)
    }
}

pub fn credential_key(provider: &str, label: &str) -> String {
    format!("credential:{provider}:{label}")
}

pub fn model_key(provider: &str, model: &str) -> String {
    format!("model:{provider}:{model}")
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimits {
    entries: DashMap<String, i64>,
}

impl InMemoryRateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record that has expired by `now_ms`.
    pub fn prune(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now_ms);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RateLimitStore for InMemoryRateLimits {
    fn expiry(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|e| *e)
    }

    /// Never shortens an existing, later expiry.
    fn set_expiry(&self, key: &str, until_ms: i64) {
        self.entries
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).max(until_ms))
            .or_insert(until_ms);
    }

    fn clear(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_is_available() {
        let store = InMemoryRateLimits::new();
        assert!(store.is_available("credential:gemini:k1", 0));
    }

    #[test]
    fn expiry_is_exclusive_of_the_future() {
        let store = InMemoryRateLimits::new();
        store.set_expiry("k", 1_000);
        assert!(!store.is_available("k", 999));
        assert!(store.is_available("k", 1_000));
        assert!(store.is_available("k", 5_000));
    }

    #[test]
    fn later_expiry_wins() {
        let store = InMemoryRateLimits::new();
        store.set_expiry("k", 5_000);
        store.set_expiry("k", 2_000);
        assert_eq!(store.expiry("k"), Some(5_000));
    }

    #[test]
    fn clear_and_prune() {
        let store = InMemoryRateLimits::new();
        store.set_expiry("a", 10);
        store.set_expiry("b", 100);
        store.clear("a");
        assert_eq!(store.expiry("a"), None);
        store.set_expiry("c", 20);
        assert_eq!(store.prune(50), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keys_are_namespaced() {
        assert_ne!(credential_key("gemini", "x"), model_key("gemini", "x"));
    }
}
