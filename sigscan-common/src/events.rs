//! Event types for the scanner event system
//!
//! Provides the shared event definitions and the broadcast EventBus used by
//! the fetch layer, cache, orchestrator and learner. Events serialize with a
//! `type` tag so they can be forwarded verbatim over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Circuit breaker position for one upstream source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Result classification of a single upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcomeKind {
    Success,
    /// Provider answered with data it marked stale
    Stale,
    Failure,
    RateLimited,
    CircuitOpen,
}

/// Why a background refresh was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    StaleWhileRevalidate,
    Prefetch,
}

/// Scanner event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanEvent {
    /// A scan was accepted and its pipelines are starting
    ScanStarted {
        scan_id: Uuid,
        mode: String,
        requested: usize,
        timestamp: DateTime<Utc>,
    },

    /// A scan finished, either fully or at its deadline
    ScanCompleted {
        scan_id: Uuid,
        status: String,
        requested: usize,
        completed: usize,
        completion_ratio: f64,
        timestamp: DateTime<Utc>,
    },

    /// Success/failure sample for one upstream call
    ///
    /// Emitted on every call; no subscriber is required.
    FetchSample {
        source: String,
        data_class: String,
        outcome: FetchOutcomeKind,
        latency_ms: u64,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    CircuitStateChanged {
        source: String,
        from: BreakerState,
        to: BreakerState,
        timestamp: DateTime<Utc>,
    },

    /// Cache handed a refresh to the background
    RefreshScheduled {
        source: String,
        identifier: String,
        data_class: String,
        reason: RefreshReason,
        timestamp: DateTime<Utc>,
    },

    /// Learner published a new snapshot (candidate, stage change or promotion)
    WeightsPublished {
        active_version: u64,
        candidate_version: Option<u64>,
        stage: String,
        rollout_percent: u8,
        timestamp: DateTime<Utc>,
    },

    /// Candidate failed shadow evaluation and was discarded
    CandidateRejected {
        candidate_version: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Learner restored the last-known-good vector and froze promotion
    LearnerRolledBack {
        from_version: u64,
        restored_version: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    OutcomeRecorded {
        scan_id: Uuid,
        identifier: String,
        horizon_secs: u64,
        label: String,
        timestamp: DateTime<Utc>,
    },
}

impl ScanEvent {
    /// Event type string, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::ScanStarted { .. } => "ScanStarted",
            ScanEvent::ScanCompleted { .. } => "ScanCompleted",
            ScanEvent::FetchSample { .. } => "FetchSample",
            ScanEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            ScanEvent::RefreshScheduled { .. } => "RefreshScheduled",
            ScanEvent::WeightsPublished { .. } => "WeightsPublished",
            ScanEvent::CandidateRejected { .. } => "CandidateRejected",
            ScanEvent::LearnerRolledBack { .. } => "LearnerRolledBack",
            ScanEvent::OutcomeRecorded { .. } => "OutcomeRecorded",
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper over `tokio::sync::broadcast`. Slow subscribers lag and lose
/// the oldest events; emitters never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScanEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use sigscan_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ScanEvent,
    ) -> Result<usize, broadcast::error::SendError<ScanEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ScanEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
