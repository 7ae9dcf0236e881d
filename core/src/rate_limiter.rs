// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-connection rate limiting (§4.3). Adapted from the teacher's
//! `backend/src/rate_limiter`: a fixed-window token bucket keyed by a
//! hashed `(service, action, custom)` tuple, backed here by an in-process
//! storage provider since no cross-process rate-limit store is in scope for
//! a single connection's bucket.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// The retry hint returned to clients on 429, per §6.1.
pub const RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        // §9: upstream left bucket parameters unspecified; this expansion
        // fixes 100 requests / 10s as the concrete default.
        Self {
            max_requests: 100,
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateLimitKey([u8; 32]);

impl RateLimitKey {
    fn new(service: &[u8], action: &[u8], custom: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in [service, action].into_iter().chain(custom.iter().copied()) {
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

#[derive(Debug, Clone)]
struct Allowance {
    remaining: u64,
    valid_until: Instant,
}

impl Allowance {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            remaining: config.max_requests,
            valid_until: Instant::now() + config.window,
        }
    }

    fn reset(&mut self, config: &RateLimiterConfig) {
        self.remaining = config.max_requests;
        self.valid_until = Instant::now() + config.window;
    }

    fn allowed(&mut self, config: &RateLimiterConfig) -> bool {
        if Instant::now() > self.valid_until {
            self.reset(config);
        }
        if self.remaining == 0 {
            false
        } else {
            self.remaining -= 1;
            true
        }
    }
}

/// A token bucket per connection, indexed by action name. One instance is
/// owned by each live [`crate::connection::Connection`].
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<RateLimitKey, Allowance>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the action may proceed, consuming one token.
    /// Returning `false` leaves no observable side effect (P6).
    pub async fn allow(&self, connection_id: &[u8], action: &[u8]) -> bool {
        let key = RateLimitKey::new(b"connection", action, &[connection_id]);
        let mut buckets = self.buckets.lock().await;
        let allowance = buckets
            .entry(key)
            .or_insert_with(|| Allowance::new(&self.config));
        allowance.allowed(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            assert!(limiter.allow(b"conn-1", b"Insert").await);
        }
        assert!(!limiter.allow(b"conn-1", b"Insert").await);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_connection() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        });
        assert!(limiter.allow(b"conn-1", b"Insert").await);
        assert!(!limiter.allow(b"conn-1", b"Insert").await);
        assert!(limiter.allow(b"conn-2", b"Insert").await);
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_millis(20),
        });
        assert!(limiter.allow(b"conn-1", b"Insert").await);
        assert!(!limiter.allow(b"conn-1", b"Insert").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.allow(b"conn-1", b"Insert").await);
    }
}
