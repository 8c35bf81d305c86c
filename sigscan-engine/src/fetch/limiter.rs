//! Per-source token bucket
//!
//! Backed by governor's GCRA limiter, which admits exactly like a token
//! bucket of `capacity` tokens refilled at `refill_per_sec`. Admission in any
//! window never exceeds `capacity + refill_per_sec * window`.

use crate::types::{ScanError, ScanResult, SourceId};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

pub struct TokenBucket {
    source: SourceId,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    max_wait: Duration,
}

impl TokenBucket {
    pub fn new(
        source: SourceId,
        capacity: u32,
        refill_per_sec: f64,
        max_wait: Duration,
    ) -> sigscan_common::Result<Self> {
        let burst = NonZeroU32::new(capacity).ok_or_else(|| {
            sigscan_common::Error::Config(format!("source {}: capacity must be non-zero", source))
        })?;
        if !(refill_per_sec.is_finite() && refill_per_sec > 0.0) {
            return Err(sigscan_common::Error::Config(format!(
                "source {}: refill_per_sec must be positive",
                source
            )));
        }

        let period = Duration::from_secs_f64(1.0 / refill_per_sec);
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                sigscan_common::Error::Config(format!("source {}: refill rate too high", source))
            })?
            .allow_burst(burst);

        Ok(Self {
            source,
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            max_wait,
        })
    }

    /// Take a token, waiting up to the configured `max_wait`
    pub async fn acquire(&self) -> ScanResult<Duration> {
        self.acquire_within(self.max_wait).await
    }

    /// Take a token, waiting at most `max_wait`.
    ///
    /// Rejects up front with `RateLimitExceeded` when the next token is
    /// further away than the remaining allowance. Returns the time waited.
    pub async fn acquire_within(&self, max_wait: Duration) -> ScanResult<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            match self.limiter.check() {
                Ok(()) => return Ok(waited),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    if waited + wait > max_wait {
                        debug!(
                            source = %self.source,
                            wait_ms = wait.as_millis() as u64,
                            "Token bucket rejected call"
                        );
                        return Err(ScanError::RateLimitExceeded {
                            source_id: self.source.clone(),
                            wait_ms: wait.as_millis() as u64,
                        });
                    }
                    // Another caller may take the token first, so re-check after sleeping
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }
}
