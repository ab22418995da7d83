//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use parlor_core::{Orchestrator, PushHub, SqliteStore};
use tokio::sync::watch;

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Rooms, messages, identities and usage.
    pub store: Arc<SqliteStore>,
    /// Private and room push channels; SSE handlers subscribe here.
    pub hub: Arc<PushHub>,
    pub orchestrator: Orchestrator<SqliteStore>,
    /// Flips to `true` once operations are drained; open event streams end.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Resolves when the server is shutting down.  Never resolves if the
    /// sender is gone without signalling.
    pub async fn shutting_down(&self) {
        let mut rx = self.shutdown.clone();
        let closed = rx.wait_for(|down| *down).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
