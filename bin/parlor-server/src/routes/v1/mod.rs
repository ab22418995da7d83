pub mod assistant;
pub mod events;
pub mod queries;
pub mod rooms;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(queries::router())
        .merge(events::router())
        .merge(rooms::router())
        .merge(assistant::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = V1Api::openapi();
    doc.merge(queries::QueriesApi::openapi());
    doc.merge(events::EventsApi::openapi());
    doc.merge(rooms::RoomsApi::openapi());
    doc.merge(assistant::AssistantApi::openapi());
    doc
}
