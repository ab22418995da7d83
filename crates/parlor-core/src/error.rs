//! Error types surfaced by the orchestrator.
//!
//! Only `StartQuery` can fail synchronously; everything that goes wrong after
//! the operation is registered is reported to the requester as an `error`
//! event carrying a message string.

use thiserror::Error;

use crate::registry::RegistryError;

/// Errors returned by [`crate::Orchestrator::start_query`].
#[derive(Debug, Error)]
pub enum QueryError {
    /// Empty, oversized or policy-blocked prompt. Never retried, nothing persisted.
    #[error("invalid query: {0}")]
    Validation(String),

    /// An explicit room id was supplied but no such room exists.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Propagated from the relational store.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The orchestrator is draining for shutdown and takes no new prompts.
    #[error("shutting down, not accepting new queries")]
    ShuttingDown,

    /// The registry refused the operation (duplicate id).
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for QueryError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Closed => QueryError::ShuttingDown,
            other => QueryError::Registry(other),
        }
    }
}

/// Failures establishing the upstream streaming call.
///
/// Errors that happen after the stream is open travel as
/// [`crate::upstream::StreamChunk::Error`] instead.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection could not be made or the request could not be sent.
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// The provider answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The provider answered with something that is not a token stream.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        UpstreamError::Connect(e.to_string())
    }
}
