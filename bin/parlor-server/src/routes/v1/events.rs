//! Push channels as Server-Sent Events.
//!
//! Each connection is one subscriber with its own FIFO queue in the hub.
//! Streams end when the client disconnects or the server shuts down.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::{Stream, StreamExt};
use parlor_core::store::RoomStore;
use serde::Serialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(user_events, room_events))]
pub struct EventsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", get(user_events))
        .route("/rooms/{id}/events", get(room_events))
}

/// The caller's private channel: `partial`, `done` and `error` events.
#[utoipa::path(
    get,
    path = "/v1/events",
    tag = "events",
    responses(
        (status = 200, description = "text/event-stream of private events"),
        (status = 401, description = "No caller identity"),
    )
)]
pub async fn user_events(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(user_id = %user_id, "private event stream opened");
    let rx = state.hub.subscribe_user(&user_id);
    let events = UnboundedReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(sse_event(event.kind(), &event)));
    Sse::new(until_shutdown(events, state)).keep_alive(KeepAlive::default())
}

/// A room channel: one `newMessage` per finalized assistant reply.
#[utoipa::path(
    get,
    path = "/v1/rooms/{id}/events",
    tag = "events",
    params(("id" = String, Path, description = "Room id")),
    responses(
        (status = 200, description = "text/event-stream of room events"),
        (status = 401, description = "No caller identity"),
        (status = 404, description = "Room not found"),
    )
)]
pub async fn room_events(
    State(state): State<Arc<AppState>>,
    CurrentUser(_user_id): CurrentUser,
    Path(room_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    if state.store.get_room(&room_id).await?.is_none() {
        return Err(ServerError::NotFound(format!("room {room_id}")));
    }
    let rx = state.hub.subscribe_room(&room_id);
    let events = UnboundedReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(sse_event(event.kind(), &event)));
    Ok(Sse::new(until_shutdown(events, state)).keep_alive(KeepAlive::default()))
}

fn sse_event<T: Serialize>(kind: &'static str, payload: &T) -> Event {
    Event::default().event(kind).json_data(payload).unwrap_or_else(|e| {
        warn!(error = %e, kind, "failed to encode event");
        Event::default().event(kind).data("{}")
    })
}

fn until_shutdown<S>(events: S, state: Arc<AppState>) -> impl Stream<Item = S::Item>
where
    S: Stream,
{
    events.take_until(async move { state.shutting_down().await })
}
