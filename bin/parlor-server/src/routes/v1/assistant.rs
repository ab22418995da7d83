use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parlor_core::store::IdentityStore;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::CurrentUser;
use crate::schemas::v1::assistant::AssistantResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_assistant), components(schemas(AssistantResponse)))]
pub struct AssistantApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/assistant", get(get_assistant))
}

/// The caller's current assistant identity.
#[utoipa::path(
    get,
    path = "/v1/assistant",
    tag = "assistant",
    responses(
        (status = 200, description = "Assistant identity", body = AssistantResponse),
        (status = 401, description = "No caller identity"),
    )
)]
pub async fn get_assistant(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<AssistantResponse>, ServerError> {
    let name = state
        .store
        .get_assistant_name(&user_id)
        .await?
        .unwrap_or_else(|| state.config.default_assistant_name.clone());
    Ok(Json(AssistantResponse { name }))
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use parlor_core::store::IdentityStore;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::middleware::identity::X_USER_ID;
    use crate::routes::{build, test_support};

    async fn name_for(app: axum::Router, user: &str) -> String {
        let response = app
            .oneshot(
                Request::get("/v1/assistant")
                    .header(X_USER_ID, user)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        body["name"].as_str().expect("name").to_owned()
    }

    #[tokio::test]
    async fn default_then_persisted_name() {
        let (state, _tx) = test_support::state().await;
        let app = build(state.clone());
        assert_eq!(name_for(app.clone(), "alice").await, "Assistant");

        state
            .store
            .set_assistant_name("alice", "Jarvis")
            .await
            .expect("set");
        assert_eq!(name_for(app, "alice").await, "Jarvis");
    }
}
