use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AssistantResponse {
    /// Current display name of the caller's assistant.
    pub name: String,
}
