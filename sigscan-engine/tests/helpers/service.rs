//! Service construction for integration tests

use super::MockSource;
use chrono::Utc;
use sigscan_common::config::{SigscanConfig, SourceConfig, UniverseEntry};
use sigscan_common::events::EventBus;
use sigscan_common::time::ManualClock;
use sigscan_engine::fetch::FetchRouter;
use sigscan_engine::types::{ScanReport, ScanStatus, SignalReading};
use sigscan_engine::upstream::UpstreamSource;
use sigscan_engine::ScannerService;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Six standard classes served by one source named "primary", no retries,
/// a generous bucket and small learner sample requirements
pub fn test_config(identifiers: &[&str]) -> SigscanConfig {
    let mut config = SigscanConfig::with_sample_classes();
    config.sources.insert(
        "primary".to_string(),
        SourceConfig {
            capacity: 1_000,
            refill_per_sec: 1_000.0,
            max_retries: 0,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1),
            ..SourceConfig::default()
        },
    );
    config.scan.concurrency = 4;
    config.scan.deadline = Duration::from_secs(5);
    config.scan.fetch_timeout = Duration::from_secs(2);
    config.learner.min_shadow_samples = 3;
    config.learner.min_stage_samples = 3;
    config.universe = identifiers
        .iter()
        .map(|id| UniverseEntry {
            id: id.to_string(),
            sector: None,
            tier: None,
        })
        .collect();
    config
}

/// Readings from the reference scenario for one identifier: insider 80,
/// options 70, patents unavailable, contracts 60, euphoric sentiment 90,
/// technical 40
pub fn scenario_source(identifier: &str) -> MockSource {
    let source = MockSource::new("primary");
    source.set("insider", identifier, SignalReading::new(80.0));
    source.set("options", identifier, SignalReading::new(70.0));
    source.set("contracts", identifier, SignalReading::new(60.0));
    source.set(
        "sentiment",
        identifier,
        SignalReading::new(90.0).with_attribute("volume_ratio", 3.0),
    );
    source.set("technical", identifier, SignalReading::new(40.0));
    source.make_unavailable("patents");
    source
}

/// Service over an in-memory database and a manual clock
pub async fn build_service(
    config: SigscanConfig,
    source: Arc<MockSource>,
) -> (Arc<ScannerService>, Arc<ManualClock>) {
    let pool = sigscan_common::db::init_memory_database().await.unwrap();
    build_service_on(config, source, pool).await
}

/// Service over the given database
pub async fn build_service_on(
    config: SigscanConfig,
    source: Arc<MockSource>,
    pool: SqlitePool,
) -> (Arc<ScannerService>, Arc<ManualClock>) {
    let events = EventBus::new(config.service.event_capacity);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let adapters: Vec<Arc<dyn UpstreamSource>> = vec![source as Arc<dyn UpstreamSource>];
    let router = Arc::new(FetchRouter::from_config(&config, adapters, events.clone()).unwrap());
    let service = ScannerService::build(config, router, Some(pool), clock.clone(), events)
        .await
        .unwrap();
    (service, clock)
}

/// Poll until the scan leaves `Running`
pub async fn wait_for_scan(service: &ScannerService, scan_id: Uuid) -> ScanReport {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let report = service.get_results(scan_id).await.unwrap();
        if report.status != ScanStatus::Running {
            return report;
        }
        assert!(tokio::time::Instant::now() < deadline, "scan {} never finished", scan_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
