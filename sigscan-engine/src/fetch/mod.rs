//! Rate-limited fetch layer
//!
//! One [`FetchClient`] per upstream source (token bucket, retries, circuit
//! breaker) and a [`FetchRouter`] chaining sources per data class.

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod limiter;
pub mod router;

pub use client::FetchClient;
pub use router::{FetchRouter, FetchedSignal, SignalFetcher};
