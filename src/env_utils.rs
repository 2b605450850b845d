//! Environment variable parsing utilities
//!
//! Safe, ergonomic parsing with defaults, so configuration code never
//! needs unwrap().

use std::str::FromStr;

/// Parse an environment variable with a default fallback
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable, returning None if missing or invalid
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
