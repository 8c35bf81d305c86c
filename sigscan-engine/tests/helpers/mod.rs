//! Test Helper Utilities
//!
//! Shared utilities for the sigscan-engine integration tests

pub mod mock_source;
pub mod service;

// Re-export commonly used items
pub use mock_source::MockSource;
pub use service::{build_service, build_service_on, scenario_source, test_config, wait_for_scan};
