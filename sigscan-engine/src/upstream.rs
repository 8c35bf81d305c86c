//! Upstream source boundary
//!
//! Every provider is reached through [`UpstreamSource`]. The fetch client
//! layers rate limiting, retries, the circuit breaker and fallback chaining
//! on top; adapters only translate one provider's transport.

use crate::types::{DataClass, Identifier, ScanError, ScanResult, SignalReading, SourceId};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Provider answer for one (identifier, data class)
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamReply {
    Fresh(SignalReading),
    /// Provider served data it knows is out of date
    Stale(SignalReading),
}

impl UpstreamReply {
    pub fn reading(&self) -> &SignalReading {
        match self {
            UpstreamReply::Fresh(reading) | UpstreamReply::Stale(reading) => reading,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, UpstreamReply::Stale(_))
    }

    pub fn into_reading(self) -> SignalReading {
        match self {
            UpstreamReply::Fresh(reading) | UpstreamReply::Stale(reading) => reading,
        }
    }
}

/// Uniform fetch capability implemented by every provider adapter
///
/// Errors use the scan taxonomy: `TransientFetch` is retried,
/// `UpstreamUnavailable` moves on to the next source in the chain,
/// `DataValidation` is not retried.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &SourceId;

    async fn fetch(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<UpstreamReply>;
}

/// JSON body served by HTTP providers
#[derive(Debug, Deserialize)]
struct ProviderPayload {
    score: f64,
    #[serde(default = "one")]
    confidence: f64,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, f64>,
    #[serde(default)]
    stale: bool,
}

fn one() -> f64 {
    1.0
}

/// Generic HTTP/JSON provider adapter
///
/// `GET {endpoint}/{data_class}/{identifier}` returning a [`ProviderPayload`].
pub struct HttpSource {
    id: SourceId,
    client: Client,
    endpoint: String,
}

impl HttpSource {
    pub fn new(id: SourceId, endpoint: &str, timeout: Duration) -> sigscan_common::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .user_agent(concat!("sigscan/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                sigscan_common::Error::Config(format!("HTTP client for source {}: {}", id, e))
            })?;

        Ok(Self {
            id,
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn transient(&self, message: impl Into<String>) -> ScanError {
        ScanError::TransientFetch {
            source_id: self.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl UpstreamSource for HttpSource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    async fn fetch(&self, identifier: &Identifier, data_class: &DataClass) -> ScanResult<UpstreamReply> {
        let url = format!("{}/{}/{}", self.endpoint, data_class, identifier);
        debug!(source = %self.id, url = %url, "Fetching upstream signal");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(self.transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ScanError::UpstreamUnavailable {
                data_class: data_class.clone(),
                message: format!("{} answered HTTP {}", self.id, status),
            });
        }

        let payload: ProviderPayload = response
            .json()
            .await
            .map_err(|e| ScanError::DataValidation(format!("{} payload: {}", self.id, e)))?;

        let reading = SignalReading {
            score: payload.score,
            confidence: payload.confidence,
            warnings: payload.warnings,
            attributes: payload.attributes,
        };
        Ok(if payload.stale {
            UpstreamReply::Stale(reading)
        } else {
            UpstreamReply::Fresh(reading)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_accessors() {
        let stale = UpstreamReply::Stale(SignalReading::new(42.0));
        assert!(stale.is_stale());
        assert_eq!(stale.reading().score, 42.0);
        assert!(!UpstreamReply::Fresh(SignalReading::new(1.0)).is_stale());
    }

    #[test]
    fn test_payload_defaults() {
        let payload: ProviderPayload = serde_json::from_str(r#"{"score": 61.5}"#).unwrap();
        assert_eq!(payload.confidence, 1.0);
        assert!(!payload.stale);
        assert!(payload.attributes.is_empty());
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let source = HttpSource::new(SourceId::new("alpha"), "http://localhost:9/", Duration::from_secs(1)).unwrap();
        assert_eq!(source.endpoint, "http://localhost:9");
        assert_eq!(source.source_id().as_str(), "alpha");
    }
}
