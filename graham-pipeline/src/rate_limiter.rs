//! Per-host token bucket rate limiter.
//!
//! Every target host gets its own bucket of `capacity` tokens refilled
//! continuously at `refill_per_sec`. `acquire` suspends the caller until a
//! token is available; it never fails. Waiters on one host are served in
//! arrival order because the bucket lock is FIFO and a waiter keeps it while
//! sleeping for its deficit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use graham_common::Validate;

use crate::config::RateLimitConfig;
use crate::error::PipelineError;

/// Longest single wait for a token, whatever the refill rate.
const MAX_WAIT: Duration = Duration::from_secs(3600);

// ============================================================================
// Token Bucket
// ============================================================================

/// Time to refill `deficit` tokens at `refill_per_sec`, capped at [`MAX_WAIT`].
fn deficit_wait(deficit: f64, refill_per_sec: f64) -> Duration {
    Duration::try_from_secs_f64(deficit / refill_per_sec)
        .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
            self.last_refill = now;
        }
    }
}

/// A single host's bucket.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping for the deficit if the bucket is empty.
    /// Returns how long the caller waited for refill.
    async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_per_sec, Instant::now());

        let mut waited = Duration::ZERO;
        if state.tokens < 1.0 {
            waited = deficit_wait(1.0 - state.tokens, self.refill_per_sec);
            tokio::time::sleep(waited).await;
            state.refill(self.capacity, self.refill_per_sec, Instant::now());
        }

        // Timer granularity can leave us a hair short of a full token; the
        // shortfall is carried as debt into the next refill.
        state.tokens -= 1.0;
        waited
    }

    fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            // Someone is already waiting on this host
            return false;
        };
        state.refill(self.capacity, self.refill_per_sec, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available(&self) -> Option<f64> {
        let mut state = self.state.try_lock().ok()?;
        state.refill(self.capacity, self.refill_per_sec, Instant::now());
        Some(state.tokens.max(0.0))
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Independent token buckets keyed by host.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// Create a limiter. Zero capacity or a non-positive refill rate is a
    /// startup error.
    pub fn new(config: RateLimitConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    /// Wait until a token for `key` is available and take it.
    pub async fn acquire(&self, key: &str) {
        let bucket = self.bucket(key).await;
        let waited = bucket.acquire().await;
        if !waited.is_zero() {
            debug!(
                host = %key,
                wait_ms = waited.as_millis() as u64,
                "Rate limited, waited for token"
            );
        }
    }

    /// Take a token for `key` only if one is immediately available.
    pub async fn try_acquire(&self, key: &str) -> bool {
        self.bucket(key).await.try_acquire()
    }

    /// Tokens currently available for `key`. A host that has never been seen
    /// reports a full bucket; a host with a waiter in progress reports `None`.
    pub async fn available_tokens(&self, key: &str) -> Option<f64> {
        let buckets = self.buckets.read().await;
        match buckets.get(key) {
            Some(bucket) => bucket.available(),
            None => Some(self.config.capacity as f64),
        }
    }

    /// Number of hosts with a bucket.
    pub async fn host_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().await.get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().await;
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(TokenBucket::new(
                self.config.capacity,
                self.config.refill_per_sec,
            ))
        }))
    }
}

/// Bucket key for a URL: its host, or the raw string if it does not parse.
pub fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_sec,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = RateLimiter::new(RateLimitConfig {
            capacity: 0,
            refill_per_sec: 1.0,
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_deficit_wait_is_capped() {
        assert_eq!(deficit_wait(1.0, 2.0), Duration::from_millis(500));
        assert_eq!(deficit_wait(1.0, 1e-20), MAX_WAIT);
        assert_eq!(deficit_wait(1.0, 0.0), MAX_WAIT);
        assert_eq!(deficit_wait(f64::NAN, 1.0), MAX_WAIT);
    }

    #[test]
    fn test_tiny_refill_rejected() {
        let result = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            refill_per_sec: 1e-20,
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_zero_refill_rejected() {
        let result = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            refill_per_sec: 0.0,
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sequential_acquires_are_spaced_by_refill() {
        let limiter = limiter(1, 1.0);

        let start = Instant::now();
        limiter.acquire("example.com").await;
        let first = start.elapsed();
        limiter.acquire("example.com").await;
        let second = start.elapsed();

        assert!(first < Duration::from_millis(100));
        assert!(
            second - first >= Duration::from_millis(950),
            "second acquire came after {:?}",
            second - first
        );
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let limiter = limiter(1, 0.5);

        let start = Instant::now();
        limiter.acquire("a.example.com").await;
        limiter.acquire("b.example.com").await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.host_count().await, 2);
    }

    #[tokio::test]
    async fn test_try_acquire_drains_burst() {
        let limiter = limiter(2, 0.1);
        assert!(limiter.try_acquire("h").await);
        assert!(limiter.try_acquire("h").await);
        assert!(!limiter.try_acquire("h").await);
    }

    #[tokio::test]
    async fn test_refill_restores_tokens() {
        let limiter = limiter(5, 100.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire("h").await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let available = limiter.available_tokens("h").await.unwrap();
        assert!(available >= 1.0, "available {}", available);
        assert!(available <= 5.0);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let limiter = Arc::new(limiter(1, 20.0));
        limiter.acquire("h").await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.acquire("h").await;
                order.lock().unwrap().push(i);
            }));
            // Stagger arrivals so the queue order is well defined
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("https://api.example.com/finance/600519"), "api.example.com");
        assert_eq!(host_key("not a url"), "not a url");
    }
}
