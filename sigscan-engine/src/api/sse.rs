//! Server-Sent Events stream of scanner events

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use sigscan_common::sse::event_sse_stream;
use std::convert::Infallible;

/// GET /events
///
/// Every `ScanEvent`: scan lifecycle, fetch samples, breaker transitions,
/// cache refreshes, learner publications and rollbacks, recorded outcomes.
pub async fn event_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_sse_stream("sigscan-engine", state.service.events().subscribe(), |_| true)
}
