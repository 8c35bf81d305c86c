//! # sigscan common library
//!
//! Shared code for the scanner service and its front ends:
//! - Error type
//! - Configuration surface and resolution
//! - Human-readable durations
//! - Clock abstraction
//! - Event types (ScanEvent enum) and EventBus
//! - Database initialization
//! - SSE helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod human_time;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
