//! Hot-key prefetcher and compaction loop
//!
//! A key is hot while it was requested within `cache.hot_window`. Each pass
//! refreshes hot entries that have used at least `cache.prefetch_at` of their
//! TTL, most recently requested first, capped at `cache.prefetch_batch`.

use super::{CacheKey, SignalCache};
use chrono::{DateTime, Utc};
use sigscan_common::events::RefreshReason;
use sigscan_common::time::to_chrono;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl SignalCache {
    /// One prefetch pass. Returns the number of refreshes scheduled.
    pub fn prefetch_once(&self) -> usize {
        let config = self.config().clone();
        let now = self.clock().now();
        let window_start = now - to_chrono(config.hot_window);

        // Keys that went cold stop being tracked
        self.hot_keys().retain(|_, last| *last >= window_start);

        let mut candidates: Vec<(CacheKey, DateTime<Utc>)> = self
            .hot_keys()
            .iter()
            .filter_map(|item| {
                let entry = self.entry_for(item.key())?;
                (entry.ttl_used(now) >= config.prefetch_at).then(|| (item.key().clone(), *item.value()))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut scheduled = 0;
        for (key, _) in candidates.into_iter().take(config.prefetch_batch) {
            if self.schedule_refresh(key, RefreshReason::Prefetch) {
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            debug!(scheduled, "Prefetch pass scheduled refreshes");
        }
        scheduled
    }

    /// Start the prefetch and compaction loops; both stop on `cancel`
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let prefetch = {
            let cache = self.clone();
            let cancel = cancel.clone();
            let period = cache.config().prefetch_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            cache.prefetch_once();
                        }
                    }
                }
                debug!("Prefetch loop stopped");
            })
        };

        let compaction = {
            let cache = self.clone();
            let period = cache.config().compaction_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            cache.compact().await;
                        }
                    }
                }
                debug!("Compaction loop stopped");
            })
        };

        info!("Cache background tasks started");
        vec![prefetch, compaction]
    }
}
