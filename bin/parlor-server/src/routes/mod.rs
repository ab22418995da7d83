//! Axum router construction.
//!
//! [`build`] assembles the application router:
//! - middleware layers (CORS, per-request trace span)
//! - `GET /health`
//! - the `/v1` query, event and room routes
//! - `GET /api-docs/openapi.json`

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware};
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_doc = doc::get_docs();

    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        .route("/api-docs/openapi.json", get(move || async move { Json(api_doc) }))
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parlor_core::gate::OpenGate;
    use parlor_core::registry::CancelSignal;
    use parlor_core::upstream::{GenerationRequest, Provider, StreamChunk, TokenStream};
    use parlor_core::{Orchestrator, PushHub, SqliteStore, UpstreamError};
    use tokio::sync::{mpsc, watch};

    use crate::config::Config;
    use crate::state::AppState;

    /// Replies "Hi" to every prompt, or holds the stream open when the prompt
    /// is "wait".
    pub struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn open(
            &self,
            request: GenerationRequest,
            mut cancel: CancelSignal,
        ) -> Result<TokenStream, UpstreamError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                if request.prompt == "wait" {
                    cancel.cancelled().await;
                    let _ = tx.send(StreamChunk::Cancelled).await;
                    return;
                }
                let _ = tx.send(StreamChunk::Token("Hi".into())).await;
                let _ = tx.send(StreamChunk::Done { usage: None }).await;
            });
            Ok(rx)
        }
    }

    pub async fn state() -> (Arc<AppState>, watch::Sender<bool>) {
        let config = Config::from_lookup(|_| None);
        let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
        let hub = Arc::new(PushHub::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            hub.clone(),
            Arc::new(EchoProvider),
            Arc::new(OpenGate),
            config.orchestrator_settings(),
        );
        let (tx, rx) = watch::channel(false);
        let state = Arc::new(AppState {
            config: Arc::new(config),
            store,
            hub,
            orchestrator,
            shutdown: rx,
        });
        (state, tx)
    }
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_reports_ok_and_echoes_trace_id() {
        let (state, _tx) = test_support::state().await;
        let trace_id = "7a1d1f40-5a4e-4f8e-9d59-2f3c2a0d3b11";
        let response = build(state)
            .oneshot(
                Request::get("/health")
                    .header(trace::X_TRACE_ID, trace_id)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(trace::X_TRACE_ID).and_then(|v| v.to_str().ok()),
            Some(trace_id)
        );
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert!(!body["version"].as_str().unwrap_or("").is_empty());
    }

    #[tokio::test]
    async fn openapi_document_lists_query_routes() {
        let (state, _tx) = test_support::state().await;
        let response = build(state)
            .oneshot(
                Request::get("/api-docs/openapi.json")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["paths"]["/v1/queries"].is_object());
        assert!(body["paths"]["/health"].is_object());
    }
}
