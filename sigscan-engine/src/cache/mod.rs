//! Multi-tier signal cache
//!
//! **Tiers:**
//! - Recency: capacity-bounded LRU for short-TTL classes
//! - Durable: unbounded, mirrored to SQLite, compacted by ceiling only
//!
//! **Lookup:**
//! 1. age < TTL → fresh value
//! 2. TTL ≤ age < ceiling → stale value now, one background refresh per key
//! 3. missing or age ≥ ceiling → synchronous refetch; if that fails an
//!    expired value is served flagged `ExpiredFallback`
//!
//! Writers for a key serialize on that key's gate only. Stores are monotonic:
//! an entry never replaces one fetched later. A background refresh re-checks
//! its key under the gate and skips the fetch when another writer already
//! renewed it.

pub mod entry;
pub mod prefetch;

pub use entry::{CacheEntry, CacheKey, ClassPolicy, Freshness};

use crate::fetch::SignalFetcher;
use crate::types::{DataClass, Identifier, ScanError, ScanResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use entry::Age;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use sigscan_common::config::{CacheConfig, CacheTier, SigscanConfig};
use sigscan_common::events::{EventBus, RefreshReason, ScanEvent};
use sigscan_common::time::SharedClock;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A cached value and how fresh it was when served
#[derive(Debug, Clone)]
pub struct CachedSignal {
    pub entry: Arc<CacheEntry>,
    pub freshness: Freshness,
}

/// Counter snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub expired_fallbacks: u64,
    pub refreshes: u64,
    pub prefetches: u64,
    pub recency_entries: u64,
    pub durable_entries: u64,
    pub refreshes_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    expired_fallbacks: AtomicU64,
    refreshes: AtomicU64,
    prefetches: AtomicU64,
}

struct CacheInner {
    fetcher: Arc<dyn SignalFetcher>,
    policies: HashMap<DataClass, ClassPolicy>,
    recency: Cache<CacheKey, Arc<CacheEntry>>,
    durable: DashMap<CacheKey, Arc<CacheEntry>>,
    /// Keys with a background refresh scheduled or running
    inflight: DashMap<CacheKey, ()>,
    gates: DashMap<CacheKey, Arc<Mutex<()>>>,
    /// Last request time per key
    hot: DashMap<CacheKey, DateTime<Utc>>,
    clock: SharedClock,
    pool: Option<SqlitePool>,
    events: EventBus,
    counters: Counters,
    config: CacheConfig,
}

/// Cheap to clone; clones share the same tiers
#[derive(Clone)]
pub struct SignalCache {
    inner: Arc<CacheInner>,
}

impl SignalCache {
    pub fn new(
        fetcher: Arc<dyn SignalFetcher>,
        config: &SigscanConfig,
        clock: SharedClock,
        pool: Option<SqlitePool>,
        events: EventBus,
    ) -> Self {
        let policies = config
            .data_classes
            .iter()
            .map(|(id, class)| {
                (
                    DataClass::new(id.as_str()),
                    ClassPolicy {
                        tier: class.tier,
                        ttl: class.ttl,
                        hard_ceiling: class.hard_ceiling,
                    },
                )
            })
            .collect();

        let recency = Cache::builder()
            .max_capacity(config.cache.recency_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                policies,
                recency,
                durable: DashMap::new(),
                inflight: DashMap::new(),
                gates: DashMap::new(),
                hot: DashMap::new(),
                clock,
                pool,
                events,
                counters: Counters::default(),
                config: config.cache.clone(),
            }),
        }
    }

    /// Serve one (identifier, data class) through the cache
    pub async fn get_or_fetch(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<CachedSignal> {
        let (key, policy) = self.resolve(identifier, data_class)?;
        let now = self.inner.clock.now();
        self.inner.hot.insert(key.clone(), now);

        if let Some(entry) = self.lookup(&key, policy.tier) {
            match entry.age_at(now) {
                Age::Fresh => {
                    self.inner.counters.fresh_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CachedSignal {
                        entry,
                        freshness: Freshness::Fresh,
                    });
                }
                Age::Stale => {
                    self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                    self.schedule_refresh(key, RefreshReason::StaleWhileRevalidate);
                    return Ok(CachedSignal {
                        entry,
                        freshness: Freshness::Stale,
                    });
                }
                Age::Expired => {}
            }
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch_through(key, policy).await
    }

    /// Current entry for a key without fetching or touching hot tracking
    pub fn peek(&self, identifier: &Identifier, data_class: &DataClass) -> Option<Arc<CacheEntry>> {
        let (key, policy) = self.resolve(identifier, data_class).ok()?;
        self.lookup(&key, policy.tier)
    }

    /// Insert an entry directly, keeping monotonicity
    pub async fn put(&self, entry: CacheEntry) -> ScanResult<Arc<CacheEntry>> {
        let policy = self.policy(&entry.key.data_class)?;
        let gate = self.gate(&entry.key);
        let _held = gate.lock().await;
        Ok(self.store(Arc::new(entry), policy.tier).await)
    }

    /// Drop every entry past its ceiling from both tiers and the database
    pub async fn compact(&self) -> usize {
        let now = self.inner.clock.now();

        let expired_recent: Vec<CacheKey> = self
            .inner
            .recency
            .iter()
            .filter(|(_, entry)| entry.age_at(now) == Age::Expired)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &expired_recent {
            self.inner.recency.invalidate(key);
        }

        let expired_durable: Vec<CacheKey> = self
            .inner
            .durable
            .iter()
            .filter(|item| item.value().age_at(now) == Age::Expired)
            .map(|item| item.key().clone())
            .collect();
        for key in &expired_durable {
            self.inner
                .durable
                .remove_if(key, |_, entry| entry.age_at(now) == Age::Expired);
            if let Some(pool) = &self.inner.pool {
                if let Err(e) = crate::db::cache::delete_entry(pool, key).await {
                    warn!(identifier = %key.identifier, data_class = %key.data_class, error = %e, "Failed to delete compacted entry");
                }
            }
        }

        // Gates nobody holds can go; a later writer recreates them
        self.inner.gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        self.inner.recency.run_pending_tasks();

        let removed = expired_recent.len() + expired_durable.len();
        if removed > 0 {
            info!(
                recency = expired_recent.len(),
                durable = expired_durable.len(),
                "Compacted expired cache entries"
            );
        }
        removed
    }

    /// Warm the durable tier from the database, dropping rows past their ceiling
    pub async fn load_durable(&self) -> ScanResult<usize> {
        let Some(pool) = &self.inner.pool else {
            return Ok(0);
        };

        let now = self.inner.clock.now();
        let mut loaded = 0;
        for entry in crate::db::cache::load_entries(pool).await? {
            let durable = matches!(
                self.inner.policies.get(&entry.key.data_class),
                Some(policy) if policy.tier == CacheTier::Durable
            );
            if !durable || entry.age_at(now) == Age::Expired {
                crate::db::cache::delete_entry(pool, &entry.key).await?;
                continue;
            }
            self.inner.durable.insert(entry.key.clone(), Arc::new(entry));
            loaded += 1;
        }

        info!(entries = loaded, "Loaded durable cache tier");
        Ok(loaded)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            fresh_hits: c.fresh_hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expired_fallbacks: c.expired_fallbacks.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
            recency_entries: self.inner.recency.entry_count(),
            durable_entries: self.inner.durable.len() as u64,
            refreshes_in_flight: self.inner.inflight.len(),
        }
    }

    fn policy(&self, data_class: &DataClass) -> ScanResult<ClassPolicy> {
        self.inner
            .policies
            .get(data_class)
            .copied()
            .ok_or_else(|| ScanError::InvalidInput(format!("unknown data class '{}'", data_class)))
    }

    fn resolve(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<(CacheKey, ClassPolicy)> {
        let policy = self.policy(data_class)?;
        let source = self
            .inner
            .fetcher
            .primary_source(data_class)
            .ok_or_else(|| ScanError::InvalidInput(format!("no source for data class '{}'", data_class)))?;
        Ok((
            CacheKey {
                source,
                identifier: identifier.clone(),
                data_class: data_class.clone(),
            },
            policy,
        ))
    }

    fn lookup(&self, key: &CacheKey, tier: CacheTier) -> Option<Arc<CacheEntry>> {
        match tier {
            CacheTier::Recency => self.inner.recency.get(key),
            CacheTier::Durable => self.inner.durable.get(key).map(|e| e.value().clone()),
        }
    }

    fn gate(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.inner
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write under the key's gate. Returns whichever entry ends up stored.
    async fn store(&self, entry: Arc<CacheEntry>, tier: CacheTier) -> Arc<CacheEntry> {
        if let Some(existing) = self.lookup(&entry.key, tier) {
            if existing.fetched_at > entry.fetched_at {
                debug!(identifier = %entry.key.identifier, data_class = %entry.key.data_class, "Kept newer cache entry");
                return existing;
            }
        }

        match tier {
            CacheTier::Recency => self.inner.recency.insert(entry.key.clone(), entry.clone()),
            CacheTier::Durable => {
                self.inner.durable.insert(entry.key.clone(), entry.clone());
                if let Some(pool) = &self.inner.pool {
                    if let Err(e) = crate::db::cache::upsert_entry(pool, &entry).await {
                        warn!(identifier = %entry.key.identifier, data_class = %entry.key.data_class, error = %e, "Failed to persist durable cache entry");
                    }
                }
            }
        }
        entry
    }

    /// Synchronous path: one fetch per key at a time, re-checked under the gate
    async fn fetch_through(&self, key: CacheKey, policy: ClassPolicy) -> ScanResult<CachedSignal> {
        let gate = self.gate(&key);
        let _held = gate.lock().await;

        let existing = self.lookup(&key, policy.tier);
        if let Some(entry) = &existing {
            match entry.age_at(self.inner.clock.now()) {
                Age::Fresh => {
                    return Ok(CachedSignal {
                        entry: entry.clone(),
                        freshness: Freshness::Fresh,
                    })
                }
                Age::Stale => {
                    self.schedule_refresh(key, RefreshReason::StaleWhileRevalidate);
                    return Ok(CachedSignal {
                        entry: entry.clone(),
                        freshness: Freshness::Stale,
                    });
                }
                Age::Expired => {}
            }
        }

        match self.inner.fetcher.fetch_signal(&key.identifier, &key.data_class).await {
            Ok(signal) => {
                let entry = Arc::new(CacheEntry {
                    key,
                    signal,
                    fetched_at: self.inner.clock.now(),
                    ttl: policy.ttl,
                    hard_ceiling: policy.hard_ceiling,
                });
                let stored = self.store(entry, policy.tier).await;
                Ok(CachedSignal {
                    entry: stored,
                    freshness: Freshness::Fresh,
                })
            }
            Err(e) => match existing {
                Some(entry) => {
                    warn!(
                        identifier = %entry.key.identifier,
                        data_class = %entry.key.data_class,
                        error = %e,
                        "Refetch failed, serving expired entry"
                    );
                    self.inner.counters.expired_fallbacks.fetch_add(1, Ordering::Relaxed);
                    Ok(CachedSignal {
                        entry,
                        freshness: Freshness::ExpiredFallback,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// Schedule one background refresh for a key. Returns false if one is
    /// already pending.
    pub(crate) fn schedule_refresh(&self, key: CacheKey, reason: RefreshReason) -> bool {
        if self.inner.inflight.insert(key.clone(), ()).is_some() {
            return false;
        }

        let counter = match reason {
            RefreshReason::StaleWhileRevalidate => &self.inner.counters.refreshes,
            RefreshReason::Prefetch => &self.inner.counters.prefetches,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.inner.events.emit_lossy(ScanEvent::RefreshScheduled {
            source: key.source.to_string(),
            identifier: key.identifier.to_string(),
            data_class: key.data_class.to_string(),
            reason,
            timestamp: self.inner.clock.now(),
        });

        let cache = self.clone();
        tokio::spawn(async move {
            cache.refresh(&key, reason).await;
            cache.inner.inflight.remove(&key);
        });
        true
    }

    async fn refresh(&self, key: &CacheKey, reason: RefreshReason) {
        let Ok(policy) = self.policy(&key.data_class) else {
            return;
        };
        let gate = self.gate(key);
        let _held = gate.lock().await;

        if let Some(current) = self.lookup(key, policy.tier) {
            let now = self.inner.clock.now();
            let due = match reason {
                RefreshReason::StaleWhileRevalidate => current.age_at(now) != Age::Fresh,
                RefreshReason::Prefetch => current.ttl_used(now) >= self.inner.config.prefetch_at,
            };
            if !due {
                debug!(identifier = %key.identifier, data_class = %key.data_class, ?reason, "Entry already renewed, refresh skipped");
                return;
            }
        }

        match self.inner.fetcher.fetch_signal(&key.identifier, &key.data_class).await {
            Ok(signal) => {
                let entry = Arc::new(CacheEntry {
                    key: key.clone(),
                    signal,
                    fetched_at: self.inner.clock.now(),
                    ttl: policy.ttl,
                    hard_ceiling: policy.hard_ceiling,
                });
                self.store(entry, policy.tier).await;
                debug!(identifier = %key.identifier, data_class = %key.data_class, "Background refresh stored");
            }
            Err(e) => {
                warn!(
                    identifier = %key.identifier,
                    data_class = %key.data_class,
                    error = %e,
                    "Background refresh failed; stale entry kept"
                );
            }
        }
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub(crate) fn hot_keys(&self) -> &DashMap<CacheKey, DateTime<Utc>> {
        &self.inner.hot
    }

    pub(crate) fn entry_for(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let policy = self.policy(&key.data_class).ok()?;
        self.lookup(key, policy.tier)
    }

    /// Wait until queued refreshes have finished
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        while !self.inner.inflight.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        self.inner.recency.run_pending_tasks();
    }
}
