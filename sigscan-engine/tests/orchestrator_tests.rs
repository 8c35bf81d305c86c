//! Scan orchestrator integration tests
//!
//! Full service over the mock source: scoring of the reference scenario,
//! ordering, no-data handling, deadlines and emission bookkeeping.

mod helpers;

use helpers::{build_service, scenario_source, test_config, wait_for_scan, MockSource};
use sigscan_engine::types::{Identifier, Recommendation, ScanError, ScanMode, ScanStatus, SignalReading};
use std::sync::Arc;
use std::time::Duration;

fn ids(names: &[&str]) -> Vec<Identifier> {
    names.iter().map(|n| Identifier::new(*n)).collect()
}

/// Only `options` is served, with one score per identifier
fn options_only(scores: &[(&str, f64)]) -> MockSource {
    let source = MockSource::new("primary");
    for class in ["insider", "patents", "contracts", "sentiment", "technical"] {
        source.make_unavailable(class);
    }
    for (id, score) in scores {
        source.set("options", id, SignalReading::new(*score));
    }
    source
}

#[tokio::test]
async fn test_reference_scenario_scores_and_downgrades_once() {
    let (service, _clock) = build_service(test_config(&["ACME"]), Arc::new(scenario_source("ACME"))).await;

    let scan_id = service.run_scan(ScanMode::Full, None).unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    assert_eq!(report.status, ScanStatus::Completed);
    assert_eq!(report.completion_ratio, 1.0);
    assert_eq!(report.results.len(), 1);

    let result = &report.results[0];
    assert!((result.raw_score - 60.3 / 0.88).abs() < 1e-9, "raw score {}", result.raw_score);
    assert_eq!(result.base_tier, Recommendation::Buy);
    assert_eq!(result.tier, Recommendation::Watch);
    assert_eq!(result.downgrades, vec!["euphoric_sentiment".to_string()]);
    assert_eq!(result.absent.len(), 1);
    assert_eq!(result.absent[0].signal, "patents");

    let effective: f64 = result.contributions.iter().map(|c| c.effective_weight).sum();
    assert!((effective - 1.0).abs() < 1e-12);
}

#[tokio::test]
async fn test_results_sorted_by_score_then_identifier() {
    let source = options_only(&[("ALPHA", 50.0), ("BRAVO", 70.0), ("CHARLIE", 50.0), ("DELTA", 90.0)]);
    let (service, _clock) = build_service(test_config(&["CHARLIE", "ALPHA", "DELTA", "BRAVO"]), Arc::new(source)).await;

    let scan_id = service.run_scan(ScanMode::Full, None).unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    let order: Vec<&str> = report.results.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(order, vec!["DELTA", "BRAVO", "ALPHA", "CHARLIE"]);
}

#[tokio::test]
async fn test_unknown_and_empty_identifiers_are_reported_as_no_data() {
    let source = options_only(&[("ACME", 60.0)]);
    let (service, _clock) = build_service(test_config(&["ACME", "BARE"]), Arc::new(source)).await;

    let scan_id = service
        .run_scan(ScanMode::Full, Some(ids(&["ACME", "BARE", "GHOST"])))
        .unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    assert_eq!(report.requested, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.completion_ratio, 1.0);
    assert_eq!(report.results.len(), 1);

    let no_data: Vec<&str> = report.no_data.iter().map(|n| n.identifier.as_str()).collect();
    assert_eq!(no_data, vec!["BARE", "GHOST"]);
    assert_eq!(report.no_data[1].reasons[0].reason, "unknown identifier");
    // BARE has every class absent, each with its failure as reason
    assert_eq!(report.no_data[0].reasons.len(), 6);
}

#[tokio::test]
async fn test_deadline_keeps_finished_results() {
    let source = options_only(&[("FAST1", 60.0), ("FAST2", 70.0), ("SLOW", 80.0)]);
    source.slow_down("SLOW", Duration::from_secs(30));

    let mut config = test_config(&["FAST1", "FAST2", "SLOW"]);
    config.scan.deadline = Duration::from_millis(300);
    config.scan.fetch_timeout = Duration::from_secs(60);
    let (service, _clock) = build_service(config, Arc::new(source)).await;

    let scan_id = service.run_scan(ScanMode::Full, None).unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    assert_eq!(report.status, ScanStatus::DeadlineExceeded);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.cancelled, ids(&["SLOW"]));
    assert!((report.completion_ratio - 2.0 / 3.0).abs() < 1e-12);
}

#[tokio::test]
async fn test_quick_scan_uses_quick_classes_only() {
    let (service, _clock) = build_service(test_config(&["ACME"]), Arc::new(scenario_source("ACME"))).await;

    let scan_id = service.run_scan(ScanMode::Quick, None).unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    let signals: Vec<&str> = report.results[0].contributions.iter().map(|c| c.signal.as_str()).collect();
    assert_eq!(signals, vec!["options", "sentiment", "technical"]);
    assert!(report.results[0].absent.is_empty());
}

#[tokio::test]
async fn test_rate_limited_class_is_recorded_as_absent() {
    let mut config = test_config(&["ACME"]);
    if let Some(source) = config.sources.get_mut("primary") {
        source.capacity = 2;
        source.refill_per_sec = 0.001;
        source.max_wait = Duration::ZERO;
    }
    let (service, _clock) = build_service(config, Arc::new(scenario_source("ACME"))).await;

    let scan_id = service.run_scan(ScanMode::Quick, None).unwrap();
    let report = wait_for_scan(&service, scan_id).await;

    let result = &report.results[0];
    assert_eq!(result.contributions.len(), 2);
    assert_eq!(result.absent.len(), 1);
    assert!(result.absent[0].reason.starts_with("rate_limited"), "{}", result.absent[0].reason);
}

#[tokio::test]
async fn test_second_scan_is_served_from_cache() {
    let source = Arc::new(options_only(&[("ACME", 60.0)]));
    let (service, _clock) = build_service(test_config(&["ACME"]), source.clone()).await;

    let first = service.run_scan(ScanMode::Quick, None).unwrap();
    wait_for_scan(&service, first).await;
    let calls = source.calls();

    let second = service.run_scan(ScanMode::Quick, None).unwrap();
    let report = wait_for_scan(&service, second).await;

    // Only the failing classes are asked again
    assert_eq!(source.calls(), calls + 2);
    assert_eq!(report.results[0].raw_score, 60.0);
    assert!(service.cache().stats().fresh_hits >= 1);
}

#[tokio::test]
async fn test_concurrent_scans_agree() {
    let (service, _clock) = build_service(test_config(&["ACME"]), Arc::new(scenario_source("ACME"))).await;

    let a = service.run_scan(ScanMode::Full, None).unwrap();
    let b = service.run_scan(ScanMode::Full, None).unwrap();
    let (a, b) = (wait_for_scan(&service, a).await, wait_for_scan(&service, b).await);

    assert_eq!(a.results[0].raw_score, b.results[0].raw_score);
    assert_eq!(a.results[0].tier, b.results[0].tier);
}

#[tokio::test]
async fn test_visible_results_are_registered_as_emissions() {
    let source = options_only(&[("ACME", 60.0), ("BOLT", 40.0)]);
    let (service, _clock) = build_service(test_config(&["ACME", "BOLT"]), Arc::new(source)).await;

    let scan_id = service.run_scan(ScanMode::Full, None).unwrap();
    wait_for_scan(&service, scan_id).await;

    assert_eq!(service.tracker().emission_count(), 2);
    let emission = service.tracker().visible_emission(scan_id, &"ACME".into()).unwrap();
    assert_eq!(emission.weight_version, 1);
    assert_eq!(emission.raw_score, 60.0);
}

#[tokio::test]
async fn test_rejects_empty_subset_and_unknown_scan() {
    let (service, _clock) = build_service(test_config(&["ACME"]), Arc::new(MockSource::new("primary"))).await;

    assert!(matches!(
        service.run_scan(ScanMode::Full, Some(Vec::new())),
        Err(ScanError::InvalidInput(_))
    ));
    assert!(matches!(
        service.get_results(uuid::Uuid::new_v4()).await,
        Err(ScanError::UnknownScan(_))
    ));
}
