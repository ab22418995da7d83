//! Caller identity.
//!
//! Authentication happens in front of this service; the gateway forwards the
//! authenticated user id in `x-user-id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ServerError;

pub static X_USER_ID: &str = "x-user-id";

/// Longest accepted user id.
const MAX_USER_ID_LEN: usize = 128;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(X_USER_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_USER_ID_LEN)
            .ok_or_else(|| {
                ServerError::Unauthorized(format!("missing or invalid {X_USER_ID} header"))
            })?;
        Ok(CurrentUser(id.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use axum::http::Request;

    use super::*;

    async fn extract(header: Option<&str>) -> Result<CurrentUser, ServerError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(X_USER_ID, value);
        }
        let (mut parts, _) = builder.body(()).expect("request").into_parts();
        CurrentUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn header_is_trimmed() {
        let user = extract(Some("  alice ")).await.expect("user");
        assert_eq!(user, CurrentUser("alice".into()));
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_unauthorized() {
        assert!(matches!(extract(None).await, Err(ServerError::Unauthorized(_))));
        assert!(matches!(extract(Some("   ")).await, Err(ServerError::Unauthorized(_))));
    }
}
