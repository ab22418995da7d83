use parlor_core::store::MessageRecord;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Most messages returned by one history request.
pub const MAX_HISTORY: u32 = 500;
const DEFAULT_HISTORY: u32 = 50;

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Newest N messages (default 50, max 500).
    pub limit: Option<u32>,
}

impl HistoryQuery {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadataResponse {
    pub operation_id: Option<String>,
    pub model_id: Option<String>,
    pub cancelled: bool,
}

/// Same shape as the `newMessage` room event payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: String,
    pub room_id: String,
    pub role: String,
    pub content: String,
    pub assistant_name: Option<String>,
    pub metadata: MessageMetadataResponse,
    pub created_at: String,
}

impl From<&MessageRecord> for MessageResponse {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            room_id: record.room_id.clone(),
            role: record.role.to_string(),
            content: record.content.clone(),
            assistant_name: record.assistant_name.clone(),
            metadata: MessageMetadataResponse {
                operation_id: record.operation_id.clone(),
                model_id: record.model_id.clone(),
                cancelled: record.cancelled,
            },
            created_at: record
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        }
    }
}
