//! Server-Sent Events endpoints
//!
//! GET /events streams every job event; GET /repositories/:id/events only
//! that repository's. Missed events are not replayed: after reconnecting,
//! clients re-fetch job state with GET /jobs/:id.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use repolens_common::events::Channel;
use repolens_common::sse::subscription_sse_stream;
use std::convert::Infallible;
use uuid::Uuid;

use super::repositories::load_or_404;
use crate::error::ApiResult;
use crate::{AppState, SERVICE_NAME};

/// GET /events
pub async fn global_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    subscription_sse_stream(SERVICE_NAME, state.broadcaster.subscribe(Channel::Global))
}

/// GET /repositories/:id/events
pub async fn repository_event_stream(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    load_or_404(&state, repository_id).await?;
    let subscription = state
        .broadcaster
        .subscribe(Channel::Repository(repository_id));
    Ok(subscription_sse_stream(SERVICE_NAME, subscription))
}

pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(global_event_stream))
        .route("/repositories/:id/events", get(repository_event_stream))
}
