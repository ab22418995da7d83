//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON-body HTTP
//! response with an appropriate status code.  Internal errors are logged in
//! full; clients only see a generic message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parlor_core::QueryError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the SQLite store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// No caller identity on the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server is draining and refuses new work.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ServerError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<QueryError> for ServerError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Validation(m) => ServerError::BadRequest(m),
            QueryError::RoomNotFound(id) => ServerError::NotFound(format!("room {id}")),
            QueryError::Store(e) => ServerError::Database(e),
            e @ QueryError::ShuttingDown => ServerError::Unavailable(e.to_string()),
            QueryError::Registry(e) => ServerError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_errors_map_to_statuses() {
        let cases = [
            (QueryError::Validation("prompt is empty".into()), StatusCode::BAD_REQUEST),
            (QueryError::RoomNotFound("r1".into()), StatusCode::NOT_FOUND),
            (QueryError::Store(sqlx::Error::RowNotFound), StatusCode::INTERNAL_SERVER_ERROR),
            (QueryError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ServerError::from(err).into_response().status(), status);
        }
    }
}
