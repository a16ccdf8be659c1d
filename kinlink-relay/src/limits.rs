//! Rate limiting for kinlink-relay.
//!
//! Two keyed limiters guard the places a misbehaving client can hammer:
//! - **connection attempts** per claimed device id (WebSocket handshake)
//! - **code redemptions** per guardian id (6-digit codes are guessable)
//!
//! Both use the governor crate's keyed rate limiters backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits handshakes per claimed device id.
    connection_limiter: Arc<KeyedLimiter<String>>,

    /// Limits pairing code redemptions per guardian id.
    redeem_limiter: Arc<KeyedLimiter<String>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("redeem_keys", &self.redeem_limiter.len())
            .finish()
    }
}

/// Zero is treated as one so a bad config cannot lock everyone out by panic.
fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(per_minute(
                config.connections_per_minute,
            ))),
            redeem_limiter: Arc::new(RateLimiter::keyed(per_minute(
                config.redeem_attempts_per_minute,
            ))),
        }
    }

    /// Check if a connection attempt for `device_id` is allowed.
    pub fn check_connection(&self, device_id: &str) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&device_id.to_string())
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a redemption attempt by `guardian_id` is allowed.
    pub fn check_redeem(&self, guardian_id: &str) -> Result<(), RateLimitError> {
        self.redeem_limiter
            .check_key(&guardian_id.to_string())
            .map_err(|_| RateLimitError::RedeemLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked redemption keys (for metrics).
    pub fn redeem_keys_count(&self) -> usize {
        self.redeem_limiter.len()
    }

    /// Evict idle entries from the keyed limiters.
    ///
    /// Call periodically from the cleanup task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.redeem_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts for this device id.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many pairing code redemptions by this guardian.
    #[error("redeem rate limit exceeded")]
    RedeemLimitExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(connections: u32, redeems: u32) -> LimitsConfig {
        LimitsConfig {
            connections_per_minute: connections,
            redeem_attempts_per_minute: redeems,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&LimitsConfig::default());
        assert_eq!(limits.connection_keys_count(), 0);
        assert_eq!(limits.redeem_keys_count(), 0);
    }

    #[test]
    fn connection_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(3, 100));

        for _ in 0..3 {
            assert!(limits.check_connection("e1").is_ok());
        }
        assert_eq!(
            limits.check_connection("e1"),
            Err(RateLimitError::ConnectionLimitExceeded)
        );
    }

    #[test]
    fn redeem_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(100, 2));

        assert!(limits.check_redeem("g1").is_ok());
        assert!(limits.check_redeem("g1").is_ok());
        assert_eq!(
            limits.check_redeem("g1"),
            Err(RateLimitError::RedeemLimitExceeded)
        );
    }

    #[test]
    fn different_keys_have_independent_limits() {
        let limits = RateLimits::new(&test_config(1, 1));

        assert!(limits.check_connection("a").is_ok());
        assert!(limits.check_connection("a").is_err());
        assert!(limits.check_connection("b").is_ok());

        // Connection and redeem budgets are separate.
        assert!(limits.check_redeem("a").is_ok());
    }

    #[test]
    fn zero_quota_still_admits_one() {
        let limits = RateLimits::new(&test_config(0, 0));
        assert!(limits.check_connection("x").is_ok());
        assert!(limits.check_connection("x").is_err());
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::ConnectionLimitExceeded.to_string(),
            "connection rate limit exceeded"
        );
        assert_eq!(
            RateLimitError::RedeemLimitExceeded.to_string(),
            "redeem rate limit exceeded"
        );
    }

    #[test]
    fn shrink_does_not_panic() {
        let limits = RateLimits::new(&LimitsConfig::default());
        let _ = limits.check_connection("a");
        let _ = limits.check_redeem("b");
        assert!(limits.connection_keys_count() > 0);

        limits.shrink();
    }
}
