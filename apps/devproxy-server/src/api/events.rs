use std::convert::Infallible;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::debug;
use utoipa::IntoParams;

use devproxy_events::ThoughtEvent;

use crate::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub(crate) struct SinceQuery {
    /// Only events with an id above this cursor. Omit on the first poll.
    pub since: Option<u64>,
}

/// Cursor poll of the thought log. Non-destructive: every poller keeps its own cursor.
#[utoipa::path(
    get,
    path = "/ai/thoughts",
    tag = "Events",
    params(SinceQuery),
    responses((status = 200, description = "Events newer than the cursor plus the latest id", body = serde_json::Value))
)]
pub async fn thoughts(
    State(state): State<AppState>,
    Query(q): Query<SinceQuery>,
) -> impl IntoResponse {
    Json(state.hub().thoughts.drain(q.since))
}

fn sse_event(ev: &ThoughtEvent) -> SseEvent {
    let data = serde_json::to_string(ev).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .event(ev.kind().unwrap_or("thought"))
        .id(ev.id.to_string())
        .data(data)
}

/// Live thought events over SSE. `since` or `Last-Event-ID` replays retained events first.
#[utoipa::path(
    get,
    path = "/ai/thoughts/stream",
    tag = "Events",
    params(SinceQuery),
    responses((status = 200, description = "text/event-stream of thought events"))
)]
pub async fn thoughts_stream(
    State(state): State<AppState>,
    Query(q): Query<SinceQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let resume = q.since.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    });
    // Subscribe before draining so nothing published in between is lost.
    let live = state.hub().thoughts.subscribe();
    let (replay, floor) = match resume {
        Some(since) => {
            let drained = state.hub().thoughts.drain(Some(since));
            (drained.events, drained.latest_id)
        }
        None => (Vec::new(), state.hub().thoughts.latest_id()),
    };
    debug!(replay = replay.len(), floor, "thought stream opened");

    let replay = tokio_stream::iter(replay.into_iter().map(|ev| sse_event(&ev)));
    let live = BroadcastStream::new(live).filter_map(move |item| match item {
        Ok(ev) if ev.id > floor => Some(sse_event(&ev)),
        Ok(_) => None,
        Err(err) => {
            debug!(%err, "thought stream subscriber lagged");
            None
        }
    });
    let stream = replay.chain(live).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keep-alive"),
    )
}
