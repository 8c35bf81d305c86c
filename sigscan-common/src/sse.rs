//! Server-Sent Events (SSE) utilities

use crate::events::ScanEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const HEARTBEAT: Duration = Duration::from_secs(15);

/// Forward bus events to an SSE client.
///
/// `filter` selects which events this stream carries. Events dropped because
/// the client lagged are reported once as a `Lagged` SSE event carrying the
/// number of missed events.
pub fn event_sse_stream<F>(
    service_name: &'static str,
    mut rx: broadcast::Receiver<ScanEvent>,
    filter: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    F: Fn(&ScanEvent) -> bool + Send + 'static,
{
    info!("New SSE client connected to {} events", service_name);

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => {
                    match received {
                        Ok(event) if filter(&event) => {
                            let event_type = event.event_type();
                            match serde_json::to_string(&event) {
                                Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                                Err(e) => warn!("SSE: Failed to serialize event {}: {}", event_type, e),
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!("SSE: {} client lagged, {} events dropped", service_name, missed);
                            yield Ok(Event::default().event("Lagged").data(missed.to_string()));
                        }
                        Err(RecvError::Closed) => {
                            info!("SSE: {} event bus closed", service_name);
                            break;
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("heartbeat"))
}
