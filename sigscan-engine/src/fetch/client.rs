//! Rate-limited fetch client for one upstream source
//!
//! **Call sequence per attempt:**
//! 1. Ask the circuit breaker for admission (open → `UpstreamUnavailable`)
//! 2. Take a token from the source's bucket (or fail with `RateLimitExceeded`)
//! 3. Call the adapter under the per-fetch timeout
//! 4. Transient failure: back off with jitter and retry, up to `max_retries`
//!
//! A rejected call never spends a token. A half-open trial is held by a
//! `TrialGuard` from admission until its outcome is recorded.
//!
//! Every call emits one `FetchSample` event.

use super::backoff::Backoff;
use super::circuit_breaker::{Admission, CircuitBreaker, TrialGuard};
use super::limiter::TokenBucket;
use crate::types::{DataClass, Identifier, ScanError, ScanResult, SourceId};
use crate::upstream::{UpstreamReply, UpstreamSource};
use chrono::Utc;
use sigscan_common::config::SourceConfig;
use sigscan_common::events::{BreakerState, EventBus, FetchOutcomeKind, ScanEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&SourceConfig> for RetryPolicy {
    fn from(config: &SourceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
        }
    }
}

pub struct FetchClient {
    source: Arc<dyn UpstreamSource>,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    events: EventBus,
}

impl FetchClient {
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        config: &SourceConfig,
        fetch_timeout: Duration,
        events: EventBus,
    ) -> sigscan_common::Result<Self> {
        let id = source.source_id().clone();
        let bucket = TokenBucket::new(id.clone(), config.capacity, config.refill_per_sec, config.max_wait)?;
        let breaker = CircuitBreaker::new(id, config.failure_threshold, config.cooldown)
            .with_events(events.clone());

        Ok(Self {
            source,
            bucket,
            breaker,
            retry: RetryPolicy::from(config),
            fetch_timeout,
            events,
        })
    }

    pub fn source_id(&self) -> &SourceId {
        self.source.source_id()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Fetch one (identifier, data class) from this source
    pub async fn fetch(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<UpstreamReply> {
        let started = Instant::now();
        let mut backoff = Backoff::new(self.retry.backoff_initial, self.retry.backoff_max);
        let mut attempts = 0u32;

        loop {
            let admission = self.breaker.admit();
            if let Admission::Rejected { retry_in } = admission {
                debug!(
                    source = %self.source_id(),
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Circuit open, skipping source"
                );
                self.sample(data_class, FetchOutcomeKind::CircuitOpen, started, attempts);
                return Err(ScanError::UpstreamUnavailable {
                    data_class: data_class.clone(),
                    message: format!("circuit open for {}", self.source_id()),
                });
            }
            let mut trial = (admission == Admission::Trial).then(|| TrialGuard::new(&self.breaker));

            if let Err(e) = self.bucket.acquire().await {
                // Dropping an unsent trial hands the slot back
                drop(trial);
                self.sample(data_class, FetchOutcomeKind::RateLimited, started, attempts);
                return Err(e);
            }

            if let Some(guard) = trial.as_mut() {
                guard.calling();
            }
            attempts += 1;
            let result = match tokio::time::timeout(self.fetch_timeout, self.source.fetch(identifier, data_class)).await {
                Ok(result) => result,
                Err(_) => Err(ScanError::TransientFetch {
                    source_id: self.source_id().clone(),
                    message: format!("timed out after {}ms", self.fetch_timeout.as_millis()),
                }),
            };
            if let Some(guard) = trial.take() {
                guard.settle();
            }

            match result {
                Ok(reply) => {
                    self.breaker.record_success();
                    let kind = if reply.is_stale() {
                        FetchOutcomeKind::Stale
                    } else {
                        FetchOutcomeKind::Success
                    };
                    self.sample(data_class, kind, started, attempts);
                    return Ok(reply);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.record_failure();
                    if attempts > self.retry.max_retries {
                        warn!(
                            source = %self.source_id(),
                            identifier = %identifier,
                            data_class = %data_class,
                            attempts,
                            error = %e,
                            "Fetch failed after retries"
                        );
                        self.sample(data_class, FetchOutcomeKind::Failure, started, attempts);
                        return Err(e);
                    }

                    let delay = backoff.next_delay();
                    debug!(
                        source = %self.source_id(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // The source answered; only its answer was unusable
                    self.breaker.record_success();
                    self.sample(data_class, FetchOutcomeKind::Failure, started, attempts);
                    return Err(e);
                }
            }
        }
    }

    fn sample(&self, data_class: &DataClass, outcome: FetchOutcomeKind, started: Instant, attempts: u32) {
        self.events.emit_lossy(ScanEvent::FetchSample {
            source: self.source_id().to_string(),
            data_class: data_class.to_string(),
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalReading;
    use crate::upstream::mock::ScriptedSource;

    fn config() -> SourceConfig {
        SourceConfig {
            capacity: 100,
            refill_per_sec: 100.0,
            max_retries: 2,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            ..SourceConfig::default()
        }
    }

    fn transient() -> ScanError {
        ScanError::TransientFetch {
            source_id: SourceId::new("alpha"),
            message: "reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let source = Arc::new(
            ScriptedSource::always("alpha", 55.0)
                .then(Err(transient()))
                .then(Err(transient())),
        );
        let client = FetchClient::new(source.clone(), &config(), Duration::from_secs(1), EventBus::new(16)).unwrap();

        let reply = client.fetch(&"ACME".into(), &"options".into()).await.unwrap();
        assert_eq!(reply, UpstreamReply::Fresh(SignalReading::new(55.0)));
        assert_eq!(source.call_count(), 3);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries_and_opens_breaker() {
        let source = Arc::new(ScriptedSource::failing("alpha"));
        let client = FetchClient::new(source.clone(), &config(), Duration::from_secs(1), EventBus::new(16)).unwrap();

        let err = client.fetch(&"ACME".into(), &"options".into()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.call_count(), 3);
        assert_eq!(client.breaker_state(), BreakerState::Open);

        // Open breaker short-circuits without touching the source
        let err = client.fetch(&"ACME".into(), &"options".into()).await.unwrap_err();
        assert!(matches!(err, ScanError::UpstreamUnavailable { .. }));
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test]
    async fn test_validation_error_not_retried() {
        let source = Arc::new(
            ScriptedSource::always("alpha", 10.0).then(Err(ScanError::DataValidation("bad body".to_string()))),
        );
        let client = FetchClient::new(source.clone(), &config(), Duration::from_secs(1), EventBus::new(16)).unwrap();

        let err = client.fetch(&"ACME".into(), &"options".into()).await.unwrap_err();
        assert!(matches!(err, ScanError::DataValidation(_)));
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let source = Arc::new(ScriptedSource::always("alpha", 10.0).with_delay(Duration::from_secs(10)));
        let mut cfg = config();
        cfg.max_retries = 0;
        let client = FetchClient::new(source, &cfg, Duration::from_millis(200), EventBus::new(16)).unwrap();

        let err = client.fetch(&"ACME".into(), &"options".into()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_emits_fetch_sample() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let source = Arc::new(ScriptedSource::always("alpha", 70.0));
        let client = FetchClient::new(source, &config(), Duration::from_secs(1), events).unwrap();

        client.fetch(&"ACME".into(), &"options".into()).await.unwrap();
        match rx.recv().await.unwrap() {
            ScanEvent::FetchSample { outcome, attempts, .. } => {
                assert_eq!(outcome, FetchOutcomeKind::Success);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn recovering_config() -> SourceConfig {
        SourceConfig {
            max_retries: 0,
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
            ..config()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_wedge_breaker() {
        let source = Arc::new(
            ScriptedSource::always("alpha", 64.0)
                .with_delay(Duration::from_secs(5))
                .then(Err(transient())),
        );
        let client = FetchClient::new(source.clone(), &recovering_config(), Duration::from_secs(60), EventBus::new(16)).unwrap();
        let (id, class): (Identifier, DataClass) = ("ACME".into(), "options".into());

        assert!(client.fetch(&id, &class).await.is_err());
        assert_eq!(client.breaker_state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let cancelled = tokio::time::timeout(Duration::from_millis(500), client.fetch(&id, &class)).await;
        assert!(cancelled.is_err());
        assert_eq!(client.breaker_state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let reply = client.fetch(&id, &class).await.unwrap();
        assert_eq!(reply.reading().score, 64.0);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_does_not_spend_tokens() {
        let source = Arc::new(ScriptedSource::always("alpha", 40.0).then(Err(transient())));
        let mut cfg = recovering_config();
        cfg.capacity = 2;
        cfg.refill_per_sec = 0.001;
        cfg.max_wait = Duration::ZERO;
        let client = FetchClient::new(source.clone(), &cfg, Duration::from_secs(1), EventBus::new(16)).unwrap();
        let (id, class): (Identifier, DataClass) = ("ACME".into(), "options".into());

        assert!(client.fetch(&id, &class).await.is_err());
        for _ in 0..5 {
            let err = client.fetch(&id, &class).await.unwrap_err();
            assert!(matches!(err, ScanError::UpstreamUnavailable { .. }));
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        client.fetch(&id, &class).await.unwrap();
        assert_eq!(source.call_count(), 2);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_trial_is_handed_back() {
        let source = Arc::new(ScriptedSource::always("alpha", 40.0).then(Err(transient())));
        let mut cfg = recovering_config();
        cfg.capacity = 1;
        cfg.refill_per_sec = 0.001;
        cfg.max_wait = Duration::ZERO;
        let client = FetchClient::new(source.clone(), &cfg, Duration::from_secs(1), EventBus::new(16)).unwrap();
        let (id, class): (Identifier, DataClass) = ("ACME".into(), "options".into());

        assert!(client.fetch(&id, &class).await.is_err());
        tokio::time::advance(Duration::from_secs(11)).await;

        let err = client.fetch(&id, &class).await.unwrap_err();
        assert!(matches!(err, ScanError::RateLimitExceeded { .. }));
        assert_eq!(client.breaker_state(), BreakerState::HalfOpen);
        assert_eq!(client.breaker.admit(), Admission::Trial);
    }
}
