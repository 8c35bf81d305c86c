//! Fallback chaining across sources
//!
//! Each data class has a chain: its primary source followed by configured
//! fallbacks. A link that is rate limited, unavailable, open-circuited or
//! failing hands over to the next link. When the whole chain fails the error
//! is `RateLimitExceeded` only if every link was rate limited, otherwise
//! `UpstreamUnavailable`.

use super::client::FetchClient;
use crate::types::{DataClass, Identifier, ScanError, ScanResult, SignalReading, SourceId};
use crate::upstream::{HttpSource, UpstreamSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sigscan_common::config::SigscanConfig;
use sigscan_common::events::{BreakerState, EventBus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A reading plus where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedSignal {
    pub reading: SignalReading,
    pub served_by: SourceId,
    /// Provider flagged the data as stale
    pub upstream_stale: bool,
}

/// What the cache needs from the fetch layer
#[async_trait]
pub trait SignalFetcher: Send + Sync {
    async fn fetch_signal(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<FetchedSignal>;

    /// Primary source of a data class (part of the cache key)
    fn primary_source(&self, data_class: &DataClass) -> Option<SourceId>;
}

pub struct FetchRouter {
    clients: HashMap<SourceId, Arc<FetchClient>>,
    chains: HashMap<DataClass, Vec<SourceId>>,
}

impl FetchRouter {
    /// Wire configured sources and data-class chains onto the given adapters
    pub fn from_config(
        config: &SigscanConfig,
        adapters: Vec<Arc<dyn UpstreamSource>>,
        events: EventBus,
    ) -> sigscan_common::Result<Self> {
        let adapters: HashMap<SourceId, Arc<dyn UpstreamSource>> = adapters
            .into_iter()
            .map(|a| (a.source_id().clone(), a))
            .collect();

        let mut clients = HashMap::new();
        for (id, source_config) in &config.sources {
            let source_id = SourceId::new(id.as_str());
            let adapter = adapters.get(&source_id).cloned().ok_or_else(|| {
                sigscan_common::Error::Config(format!("no adapter registered for source '{}'", id))
            })?;
            let client = FetchClient::new(adapter, source_config, config.scan.fetch_timeout, events.clone())?;
            clients.insert(source_id, Arc::new(client));
        }

        let chains = config
            .data_classes
            .iter()
            .map(|(class, class_config)| {
                let chain = class_config.chain().map(SourceId::from).collect();
                (DataClass::new(class.as_str()), chain)
            })
            .collect();

        info!(sources = clients.len(), "Fetch router ready");
        Ok(Self { clients, chains })
    }

    /// HTTP adapters for every source from its configured endpoint
    pub fn http_from_config(config: &SigscanConfig, events: EventBus) -> sigscan_common::Result<Self> {
        let mut adapters: Vec<Arc<dyn UpstreamSource>> = Vec::new();
        for (id, source) in &config.sources {
            let endpoint = source.endpoint.as_deref().ok_or_else(|| {
                sigscan_common::Error::Config(format!("sources.{}.endpoint is required", id))
            })?;
            adapters.push(Arc::new(HttpSource::new(
                SourceId::new(id.as_str()),
                endpoint,
                config.scan.fetch_timeout,
            )?));
        }
        Self::from_config(config, adapters, events)
    }

    /// Breaker state per source, sorted by source id
    pub fn source_health(&self) -> Vec<(SourceId, BreakerState)> {
        let mut health: Vec<_> = self
            .clients
            .iter()
            .map(|(id, client)| (id.clone(), client.breaker_state()))
            .collect();
        health.sort_by(|a, b| a.0.cmp(&b.0));
        health
    }
}

#[async_trait]
impl SignalFetcher for FetchRouter {
    async fn fetch_signal(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<FetchedSignal> {
        let chain = self.chains.get(data_class).ok_or_else(|| ScanError::UpstreamUnavailable {
            data_class: data_class.clone(),
            message: "no sources configured".to_string(),
        })?;

        let mut rate_limited = 0usize;
        let mut shortest_wait: Option<u64> = None;
        let mut failures = Vec::new();

        for (position, source_id) in chain.iter().enumerate() {
            let Some(client) = self.clients.get(source_id) else {
                failures.push(format!("{}: not configured", source_id));
                continue;
            };

            match client.fetch(identifier, data_class).await {
                Ok(reply) => {
                    if position > 0 {
                        info!(
                            identifier = %identifier,
                            data_class = %data_class,
                            source = %source_id,
                            "Served by fallback source"
                        );
                    }
                    let upstream_stale = reply.is_stale();
                    return Ok(FetchedSignal {
                        reading: reply.into_reading(),
                        served_by: source_id.clone(),
                        upstream_stale,
                    });
                }
                Err(ScanError::RateLimitExceeded { wait_ms, .. }) => {
                    debug!(source = %source_id, data_class = %data_class, "Link rate limited, trying next");
                    rate_limited += 1;
                    shortest_wait = Some(shortest_wait.map_or(wait_ms, |w| w.min(wait_ms)));
                    failures.push(format!("{}: rate limited", source_id));
                }
                Err(e) => {
                    debug!(source = %source_id, data_class = %data_class, error = %e, "Link failed, trying next");
                    failures.push(format!("{}: {}", source_id, e));
                }
            }
        }

        if rate_limited > 0 && rate_limited == chain.len() {
            return Err(ScanError::RateLimitExceeded {
                source_id: chain[0].clone(),
                wait_ms: shortest_wait.unwrap_or(0),
            });
        }

        warn!(
            identifier = %identifier,
            data_class = %data_class,
            "Every source in the chain failed"
        );
        Err(ScanError::UpstreamUnavailable {
            data_class: data_class.clone(),
            message: failures.join("; "),
        })
    }

    fn primary_source(&self, data_class: &DataClass) -> Option<SourceId> {
        self.chains.get(data_class).and_then(|chain| chain.first().cloned())
    }
}
