//! Wall-clock helpers
//!
//! All timestamps are milliseconds since the Unix epoch. There is no shared
//! clock between mesh bases; these values are only compared locally.

use chrono::Utc;

/// Store-format value for "never expires"
pub const NEVER: i64 = -1;

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert an optional expiry into the store format
pub fn expires_to_store(expires: Option<i64>) -> i64 {
    expires.unwrap_or(NEVER)
}

/// Convert a store-format expiry back; negative values mean "never"
pub fn expires_from_store(expires: i64) -> Option<i64> {
    if expires < 0 { None } else { Some(expires) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_conversion() {
        assert_eq!(expires_to_store(None), NEVER);
        assert_eq!(expires_from_store(NEVER), None);
        assert_eq!(expires_from_store(expires_to_store(Some(42))), Some(42));
    }

    #[test]
    fn test_now_is_positive() {
        assert!(now_millis() > 0);
    }
}
