//! Cache keys, entries and freshness

use crate::fetch::FetchedSignal;
use crate::types::{DataClass, Identifier, SourceId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sigscan_common::config::CacheTier;
use sigscan_common::time::to_chrono;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    /// Primary source of the data class
    pub source: SourceId,
    pub identifier: Identifier,
    pub data_class: DataClass,
}

/// Freshness rules for one data class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassPolicy {
    pub tier: CacheTier,
    pub ttl: Duration,
    pub hard_ceiling: Duration,
}

/// Immutable cached value; replaced wholesale, never mutated
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub signal: FetchedSignal,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub hard_ceiling: Duration,
}

/// How a returned value relates to its TTL and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Past TTL, inside the ceiling; a background refresh is scheduled
    Stale,
    /// Past the ceiling and the synchronous refetch failed
    ExpiredFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Age {
    Fresh,
    Stale,
    Expired,
}

impl CacheEntry {
    pub(crate) fn age_at(&self, now: DateTime<Utc>) -> Age {
        let age = now - self.fetched_at;
        if age < to_chrono(self.ttl) {
            Age::Fresh
        } else if age < to_chrono(self.hard_ceiling) {
            Age::Stale
        } else {
            Age::Expired
        }
    }

    /// Fraction of the TTL already used
    pub(crate) fn ttl_used(&self, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - self.fetched_at).num_milliseconds().max(0) as f64;
        let ttl_ms = self.ttl.as_millis().max(1) as f64;
        age_ms / ttl_ms
    }
}
