use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use parlor_core::store::{MessageStore, RoomStore};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::CurrentUser;
use crate::schemas::v1::room::{HistoryQuery, MessageMetadataResponse, MessageResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_room_messages),
    components(schemas(MessageResponse, MessageMetadataResponse))
)]
pub struct RoomsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/rooms/{id}/messages", get(list_room_messages))
}

/// Persisted history of a room, oldest first.
#[utoipa::path(
    get,
    path = "/v1/rooms/{id}/messages",
    tag = "rooms",
    params(("id" = String, Path, description = "Room id"), HistoryQuery),
    responses(
        (status = 200, description = "Room messages", body = [MessageResponse]),
        (status = 401, description = "No caller identity"),
        (status = 404, description = "Room not found"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn list_room_messages(
    State(state): State<Arc<AppState>>,
    CurrentUser(_user_id): CurrentUser,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageResponse>>, ServerError> {
    if state.store.get_room(&room_id).await?.is_none() {
        return Err(ServerError::NotFound(format!("room {room_id}")));
    }
    let messages = state
        .store
        .list_room_messages(&room_id, query.limit())
        .await?;
    Ok(Json(messages.iter().map(MessageResponse::from).collect()))
}
