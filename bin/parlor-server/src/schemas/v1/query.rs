use parlor_core::QueryAck;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartQueryRequest {
    /// Target room; the caller's default room when absent.
    #[validate(length(min = 1, max = 128))]
    pub room_id: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartQueryResponse {
    pub operation_id: String,
    pub room_id: String,
    pub prompt_message_id: String,
}

impl From<QueryAck> for StartQueryResponse {
    fn from(ack: QueryAck) -> Self {
        Self {
            operation_id: ack.operation_id,
            room_id: ack.room_id,
            prompt_message_id: ack.prompt_message_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelQueryResponse {
    pub cancelled: bool,
}
