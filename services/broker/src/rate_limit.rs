//! Per-caller fixed-window rate limiting.
//!
//! Buckets live behind the [`RateLimitStore`] trait. The bundled
//! [`InMemoryRateLimitStore`] only works for a single broker process; a
//! multi-instance deployment needs a store shared between instances.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// Request count for one caller within the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub count: u32,
    pub window_start: Instant,
}

impl Bucket {
    fn expired(&self, window: Duration, now: Instant) -> bool {
        now > self.window_start + window
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Records one request for `identity` and returns the updated bucket.
    ///
    /// A bucket whose window has elapsed is reset before counting.
    async fn hit(&self, identity: &str, window: Duration, now: Instant) -> Bucket;

    /// Drops buckets whose window has elapsed. Returns how many were removed.
    async fn evict_expired(&self, window: Duration, now: Instant) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    buckets: DashMap<String, Bucket>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, identity: &str, window: Duration, now: Instant) -> Bucket {
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert(Bucket {
                count: 0,
                window_start: now,
            });
        if bucket.expired(window, now) {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.count = bucket.count.saturating_add(1);
        *bucket
    }

    async fn evict_expired(&self, window: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.expired(window, now));
        before.saturating_sub(self.buckets.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Fixed quota of `max` requests per `window` for each caller identity.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    max: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, max: u32, window: Duration) -> Self {
        Self { store, max, window }
    }

    pub fn in_memory(max: u32, window: Duration) -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()), max, window)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn check(&self, identity: &str) -> Decision {
        let now = Instant::now();
        let bucket = self.store.hit(identity, self.window, now).await;
        if bucket.count > self.max {
            let retry_after = (bucket.window_start + self.window).saturating_duration_since(now);
            debug!(%identity, count = bucket.count, "Rate limit exceeded");
            Decision::Limited { retry_after }
        } else {
            Decision::Allowed {
                remaining: self.max - bucket.count,
            }
        }
    }

    /// Removes buckets for callers whose window has rolled over.
    pub async fn sweep(&self) -> usize {
        let evicted = self.store.evict_expired(self.window, Instant::now()).await;
        if evicted > 0 {
            debug!(evicted, "Evicted expired rate-limit buckets");
        }
        evicted
    }
}
