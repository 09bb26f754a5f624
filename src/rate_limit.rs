//! Per-DID sliding-window rate limiter (C4, spec §4.4).
//!
//! Process-local only, as spec §9(a) documents as an explicit open question:
//! horizontal scaling would need an external store (e.g. Redis) shared across
//! backend instances; this repo implements the documented single-process
//! approximation, the same way the teacher keeps its `RelayState` caches
//! in-process behind `DashMap`.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const CAPACITY: usize = 5;
const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            hits: DashMap::new(),
        }
    }

    /// Records a request for `did` and returns `true` if it is within the
    /// limit (<= 5 requests / 60s), `false` if it must be rejected
    /// `RATE_LIMITED` (spec P10: the 6th request within the window fails).
    pub fn check(&self, did: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(did.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) <= WINDOW);
        if entry.len() >= CAPACITY {
            return false;
        }
        entry.push(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..CAPACITY {
            assert!(limiter.check("did:key:alice"));
        }
        assert!(!limiter.check("did:key:alice"));
    }

    #[test]
    fn is_keyed_independently_per_did() {
        let limiter = RateLimiter::new();
        for _ in 0..CAPACITY {
            assert!(limiter.check("did:key:alice"));
        }
        assert!(limiter.check("did:key:bob"));
    }
}
