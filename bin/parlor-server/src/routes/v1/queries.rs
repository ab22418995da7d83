//! StartQuery / CancelQuery.
//!
//! `POST /v1/queries` returns as soon as the prompt is persisted; the reply
//! streams over `GET /v1/events`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;
use utoipa::OpenApi;
use validator::Validate;

use crate::error::ServerError;
use crate::middleware::CurrentUser;
use crate::schemas::v1::query::{CancelQueryResponse, StartQueryRequest, StartQueryResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(start_query, cancel_query),
    components(schemas(StartQueryRequest, StartQueryResponse, CancelQueryResponse))
)]
pub struct QueriesApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/queries", post(start_query))
        .route("/queries/{id}/cancel", post(cancel_query))
}

#[utoipa::path(
    post,
    path = "/v1/queries",
    tag = "queries",
    request_body = StartQueryRequest,
    responses(
        (status = 200, description = "Prompt accepted", body = StartQueryResponse),
        (status = 400, description = "Invalid or rejected prompt"),
        (status = 401, description = "No caller identity"),
        (status = 404, description = "Room not found"),
        (status = 500, description = "Store error"),
        (status = 503, description = "Server is shutting down"),
    )
)]
pub async fn start_query(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<StartQueryRequest>,
) -> Result<Json<StartQueryResponse>, ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let ticket = state
        .orchestrator
        .start_query(&user_id, req.room_id.as_deref(), &req.prompt)
        .await?;
    debug!(operation_id = %ticket.ack.operation_id, "query acknowledged");
    Ok(Json(ticket.into_ack().into()))
}

#[utoipa::path(
    post,
    path = "/v1/queries/{id}/cancel",
    tag = "queries",
    params(("id" = String, Path, description = "Operation id")),
    responses(
        (status = 200, description = "Cancellation signalled", body = CancelQueryResponse),
        (status = 401, description = "No caller identity"),
        (status = 404, description = "Operation finished, unknown or started by someone else"),
    )
)]
pub async fn cancel_query(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<CancelQueryResponse>, ServerError> {
    if state.orchestrator.cancel_query(&user_id, &id) {
        Ok(Json(CancelQueryResponse { cancelled: true }))
    } else {
        Err(ServerError::NotFound(format!("operation {id}")))
    }
}
