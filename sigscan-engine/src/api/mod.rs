//! HTTP API handlers
//!
//! REST endpoints for scan triggers, the outcome feed, weight inspection and
//! learner control, plus an SSE stream of scanner events.

pub mod health;
pub mod learner;
pub mod outcomes;
pub mod scans;
pub mod sse;
pub mod weights;

pub use health::health_routes;
pub use learner::learner_routes;
pub use outcomes::outcome_routes;
pub use scans::scan_routes;
pub use sse::event_stream;
pub use weights::weight_routes;
