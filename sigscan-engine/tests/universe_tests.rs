//! Universe file reload tests

mod helpers;

use helpers::{build_service, scenario_source, test_config, wait_for_scan};
use sigscan_engine::types::{Identifier, ScanError, ScanMode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_universe(path: &Path, entries: &[(&str, &str)]) {
    let body: String = entries
        .iter()
        .map(|(id, sector)| format!("[[universe]]\nid = \"{}\"\nsector = \"{}\"\n\n", id, sector))
        .collect();
    std::fs::write(path, body).unwrap();
}

fn sector(service: &sigscan_engine::ScannerService, id: &str) -> Option<String> {
    service.universe().get(&Identifier::new(id)).and_then(|r| r.sector)
}

#[tokio::test]
async fn test_reload_refreshes_attributes_and_adds_identifiers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("universe.toml");
    write_universe(&path, &[("ACME", "tech")]);

    let mut config = test_config(&[]);
    config.service.universe_file = Some(path.clone());
    let (service, _clock) = build_service(config, Arc::new(scenario_source("ACME"))).await;
    assert_eq!(service.universe().len(), 1);
    assert_eq!(sector(&service, "ACME").as_deref(), Some("tech"));

    write_universe(&path, &[("ACME", "energy"), ("BOLT", "retail")]);
    assert_eq!(service.reload_universe().unwrap(), 1);
    assert_eq!(sector(&service, "ACME").as_deref(), Some("energy"));
    assert_eq!(sector(&service, "BOLT").as_deref(), Some("retail"));

    // Identifiers dropped from the file stay scannable
    write_universe(&path, &[("BOLT", "retail")]);
    service.reload_universe().unwrap();
    let scan_id = service.run_scan(ScanMode::Quick, Some(vec!["ACME".into()])).unwrap();
    let report = wait_for_scan(&service, scan_id).await;
    assert_eq!(report.results.len(), 1);
}

#[tokio::test]
async fn test_unreadable_universe_file_keeps_current_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("universe.toml");
    write_universe(&path, &[("ACME", "tech")]);

    let mut config = test_config(&[]);
    config.service.universe_file = Some(path.clone());
    let (service, _clock) = build_service(config, Arc::new(scenario_source("ACME"))).await;

    std::fs::write(&path, "[[universe]]\nid = 7\n").unwrap();
    assert!(matches!(service.reload_universe(), Err(ScanError::Persistence(_))));
    assert_eq!(sector(&service, "ACME").as_deref(), Some("tech"));
}

#[tokio::test]
async fn test_background_loop_picks_up_changes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("universe.toml");
    write_universe(&path, &[("ACME", "tech")]);

    let mut config = test_config(&[]);
    config.service.universe_file = Some(path.clone());
    config.service.universe_refresh = Duration::from_millis(50);
    let (service, _clock) = build_service(config, Arc::new(scenario_source("ACME"))).await;

    let cancel = CancellationToken::new();
    let handles = service.spawn_background(cancel.clone());
    write_universe(&path, &[("ACME", "health")]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sector(&service, "ACME").as_deref() != Some("health") {
        assert!(tokio::time::Instant::now() < deadline, "universe never reloaded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
