//! Per-source circuit breaker
//!
//! Closed → Open after `failure_threshold` consecutive failures. After
//! `cooldown` the next caller gets a single half-open trial: success closes
//! the breaker, failure reopens it for another cooldown. The trial slot is
//! held by a [`TrialGuard`], so a trial whose caller is cancelled still
//! settles the breaker.

use crate::types::SourceId;
use chrono::Utc;
use sigscan_common::events::{BreakerState, EventBus, ScanEvent};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceId,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(source: SourceId, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            source,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    inner.trial_in_flight = true;
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.cooldown - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// The source answered
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.opened_at = None;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {}
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Hand back an unused trial slot; the next caller gets the trial
    pub fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;

        match to {
            BreakerState::Open => warn!(
                source = %self.source,
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit opened"
            ),
            _ => info!(source = %self.source, from = ?from, to = ?to, "Circuit state changed"),
        }

        if let Some(events) = &self.events {
            events.emit_lossy(ScanEvent::CircuitStateChanged {
                source: self.source.to_string(),
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the half-open trial slot until the trial call settles
///
/// Dropped before [`TrialGuard::calling`], the slot is handed back. Dropped
/// while the call is outstanding, the trial counts as a failure and the
/// breaker reopens.
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    calling: bool,
    settled: bool,
}

impl<'a> TrialGuard<'a> {
    pub fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            calling: false,
            settled: false,
        }
    }

    /// The trial request is about to be sent
    pub fn calling(&mut self) {
        self.calling = true;
    }

    /// The caller records the outcome itself
    pub fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.calling {
            warn!(source = %self.breaker.source, "Half-open trial dropped before it finished");
            self.breaker.record_failure();
        } else {
            self.breaker.abandon_trial();
        }
    }
}
