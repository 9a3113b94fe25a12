//! Server-Sent Events (SSE) utilities
//!
//! Turns a broadcaster [`Subscription`] into an axum SSE response.

use crate::events::Subscription;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Heartbeat interval for idle connections
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Stream every event received by `subscription` as SSE
///
/// The stream starts with a `ConnectionStatus: connected` event and ends
/// when the broadcaster drops the subscription. Missed events are not
/// replayed; clients re-fetch job state after reconnecting.
pub fn subscription_sse_stream(
    service_name: &'static str,
    mut subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        subscriber = subscription.id(),
        channel = ?subscription.channel(),
        "New SSE client connected to {}",
        service_name
    );

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        while let Some(event) = subscription.recv().await {
            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(event_json) => {
                    debug!("SSE: Forwarding event {}", event_type);
                    yield Ok(Event::default().event(event_type).data(event_json));
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                }
            }
        }

        info!(subscriber = subscription.id(), "SSE: subscription closed, ending stream");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
