//! Token-bucket gate in front of every source-control API call
//!
//! One instance is shared by all in-flight fetches. Callers suspend until
//! tokens are available; if the wait would exceed the configured maximum
//! suspend duration they get [`RateLimitError::RateLimitExceeded`] instead
//! of waiting forever.
//!
//! The bucket itself is `governor`'s GCRA (lock-free, atomic state).
//! Upstream quota headers can additionally hold all callers until the
//! upstream window resets.

use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Rate limiter errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Waiting for tokens would exceed the suspend budget; retry later
    #[error("Rate limit exceeded: permit needs {needed:?} more after waiting {waited:?}")]
    RateLimitExceeded { waited: Duration, needed: Duration },

    /// A single request asked for more tokens than the bucket can ever hold
    #[error("Request cost {cost} exceeds burst capacity {burst}")]
    InsufficientCapacity { cost: u32, burst: u32 },
}

/// Proof of admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub cost: u32,
    /// Time spent suspended before admission
    pub waited: Duration,
}

/// Token bucket sized from the upstream published quota
pub struct RateLimiter<C: Clock = DefaultClock> {
    bucket: governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
    clock: C,
    burst: NonZeroU32,
    max_suspend: Duration,
    /// Upstream reported an exhausted quota; nobody passes before this instant
    upstream_block: Mutex<Option<tokio::time::Instant>>,
    granted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter<DefaultClock> {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::with_clock(
            config.requests_per_hour,
            config.burst_capacity(),
            config.max_suspend(),
            DefaultClock::default(),
        )
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Build a limiter refilling `requests_per_hour` tokens per hour with
    /// `burst` capacity, reading time from `clock`
    ///
    /// Zero values are raised to 1.
    pub fn with_clock(requests_per_hour: u32, burst: u32, max_suspend: Duration, clock: C) -> Self {
        let rate = NonZeroU32::new(requests_per_hour).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_hour(rate).allow_burst(burst);

        Self {
            bucket: governor::RateLimiter::direct_with_clock(quota, &clock),
            clock,
            burst,
            max_suspend,
            upstream_block: Mutex::new(None),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn burst_capacity(&self) -> u32 {
        self.burst.get()
    }

    /// Non-suspending admission check
    ///
    /// `Ok(())` consumes `cost` tokens; `Err(wait)` reports how long until
    /// they would be available (no tokens consumed).
    pub fn try_acquire(&self, cost: u32) -> Result<Result<(), Duration>, RateLimitError> {
        let n = self.checked_cost(cost)?;
        match self.bucket.check_n(n) {
            Ok(Ok(())) => {
                self.granted.fetch_add(1, Ordering::Relaxed);
                Ok(Ok(()))
            }
            Ok(Err(not_until)) => Ok(Err(not_until.wait_time_from(self.clock.now()))),
            Err(_) => Err(RateLimitError::InsufficientCapacity {
                cost,
                burst: self.burst.get(),
            }),
        }
    }

    /// Suspend until `cost` tokens are available
    ///
    /// Fails fast with `RateLimitExceeded` as soon as the known remaining
    /// wait would push total suspension past the configured maximum.
    pub async fn acquire(&self, cost: u32) -> Result<Permit, RateLimitError> {
        let started = tokio::time::Instant::now();

        loop {
            if let Some(until) = self.upstream_blocked_until() {
                let now = tokio::time::Instant::now();
                if until > now {
                    self.suspend(started, until - now, "upstream quota exhausted")
                        .await?;
                    continue;
                }
            }

            match self.try_acquire(cost)? {
                Ok(()) => {
                    return Ok(Permit {
                        cost,
                        waited: started.elapsed(),
                    })
                }
                Err(wait) => self.suspend(started, wait, "bucket empty").await?,
            }
        }
    }

    /// Feed upstream quota headers into the limiter
    ///
    /// With no requests remaining, every caller is held until `reset_at`.
    pub fn observe_quota(&self, remaining: Option<u32>, reset_at: Option<DateTime<Utc>>) {
        let (Some(0), Some(reset_at)) = (remaining, reset_at) else {
            return;
        };

        let Ok(until_reset) = (reset_at - Utc::now()).to_std() else {
            return;
        };

        warn!(
            reset_in_secs = until_reset.as_secs(),
            "Upstream quota exhausted, holding requests until reset"
        );
        let until = tokio::time::Instant::now() + until_reset;
        let mut block = self.lock_block();
        *block = Some(block.map_or(until, |existing| existing.max(until)));
    }

    /// Permits granted since startup
    pub fn granted_total(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// `RateLimitExceeded` errors returned since startup
    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    async fn suspend(
        &self,
        started: tokio::time::Instant,
        wait: Duration,
        reason: &'static str,
    ) -> Result<(), RateLimitError> {
        let waited = started.elapsed();
        if waited + wait > self.max_suspend {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                waited_ms = waited.as_millis() as u64,
                needed_ms = wait.as_millis() as u64,
                reason,
                "Rate limit suspend budget exhausted"
            );
            return Err(RateLimitError::RateLimitExceeded {
                waited,
                needed: wait,
            });
        }

        debug!(wait_ms = wait.as_millis() as u64, reason, "Rate limiting: waiting");
        // Never spin on a zero wait
        tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        Ok(())
    }

    fn checked_cost(&self, cost: u32) -> Result<NonZeroU32, RateLimitError> {
        let n = NonZeroU32::new(cost).unwrap_or(NonZeroU32::MIN);
        if n > self.burst {
            return Err(RateLimitError::InsufficientCapacity {
                cost,
                burst: self.burst.get(),
            });
        }
        Ok(n)
    }

    fn upstream_blocked_until(&self) -> Option<tokio::time::Instant> {
        *self.lock_block()
    }

    fn lock_block(&self) -> std::sync::MutexGuard<'_, Option<tokio::time::Instant>> {
        self.upstream_block
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
