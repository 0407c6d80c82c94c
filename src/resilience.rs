//! Backoff, throttling and concurrency bounds shared by the replicators.
//!
//! - [`RetryConfig`]: exponential schedule for re-running failed backfill
//!   passes and reopening failed change feeds
//! - [`RateLimiter`]: token bucket in front of backfill row reads
//! - [`Bulkhead`]: bound on outstanding fire-and-forget replications
//! - [`shutdown_signalled`] / [`sleep_or_shutdown`]: shutdown-aware waits
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), index_replicator::resilience::BulkheadClosed> {
//! use index_replicator::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 100, refill_rate: 1000 });
//! limiter.acquire().await;
//!
//! let bulkhead = Bulkhead::new(256);
//! let permit = bulkhead.acquire().await?;
//! drop(permit); // slot released
//! bulkhead.drain().await;
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff schedule.
///
/// ```text
/// attempt  delay (initial 1s, factor 2, max 300s)
/// -------  -----
/// 1        1s
/// 2        2s
/// 3        4s
/// 9        256s
/// 10+      300s
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Failures tolerated before giving up; `usize::MAX` retries forever.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Shutdown-aware waits
// =============================================================================

/// Resolve once the shutdown flag is set. Never resolves if the sender is
/// dropped without signalling.
pub async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` if shutdown interrupted the sleep.
pub async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_signalled(shutdown_rx) => false,
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Token bucket parameters: `refill_rate` tokens per second, at most
/// `burst_size` banked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

/// Async token bucket. One instance is shared by every collection's backfill.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Zero rates are raised to one.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// The bulkhead's semaphore was closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed ({max_concurrent} slots)")]
pub struct BulkheadClosed {
    pub max_concurrent: usize,
}

/// Semaphore-backed bound on concurrent work.
///
/// Permits are owned so they can move into spawned tasks; a slot frees up
/// when its permit is dropped.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// `max_concurrent` is raised to one if zero.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Slots currently taken.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait until every taken slot has been released.
    pub async fn drain(&self) {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        if let Ok(permits) = self.semaphore.acquire_many(all).await {
            drop(permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(initial_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let config = schedule(100, 1000);
        let delays: Vec<u64> = (1..=6)
            .map(|a| config.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_allows_attempt() {
        let config = schedule(1, 1);
        assert!(config.allows_attempt(3));
        assert!(!config.allows_attempt(4));

        let forever = RetryConfig {
            max_attempts: usize::MAX,
            ..config
        };
        assert!(forever.allows_attempt(1_000_000));
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_millis(1), &mut rx).await);

        tx.send(true).unwrap();
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    #[tokio::test]
    async fn test_shutdown_signalled_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown_signalled(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_after_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 2,
            refill_rate: 10,
        });
        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(limiter.config().burst_size, 2);
    }

    #[test]
    fn test_rate_limiter_accepts_zero_rates() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert_eq!(limiter.config().refill_rate, 0);
    }

    #[tokio::test]
    async fn test_bulkhead_bounds_and_drains() {
        let bulkhead = Bulkhead::new(2);
        let p1 = bulkhead.acquire().await.unwrap();
        let p2 = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(10), bulkhead.acquire()).await;
        assert!(blocked.is_err());

        let drainer = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.drain().await })
        };
        drop(p1);
        drop(p2);
        drainer.await.unwrap();
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[test]
    fn test_bulkhead_minimum_one_slot() {
        assert_eq!(Bulkhead::new(0).max_concurrent(), 1);
    }
}
