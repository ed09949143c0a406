//! Token cost estimation.
//!
//! No tokenizer is consulted: a token is approximated as four characters.

use serde::Serialize;

/// Estimate the token cost of a string as `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Estimate the token cost of a value by its compact JSON serialization.
pub fn estimate_json_tokens<T: Serialize + ?Sized>(value: &T) -> u32 {
    serde_json::to_string(value)
        .map(|s| estimate_tokens(&s))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // four two-byte chars
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn json_estimate_uses_serialized_length() {
        let v = serde_json::json!({"a": 1});
        // {"a":1} is 7 chars
        assert_eq!(estimate_json_tokens(&v), 2);
    }
}
