//! Persistence collaborators.
//!
//! The orchestrator needs four things from the relational store: room
//! provisioning, chat messages, the per-user assistant identity and the
//! append-only usage ledger.  Each is its own trait so a test double can fail
//! exactly one of them; [`ChatStore`] bundles them for the orchestrator's
//! generic parameter.  The default implementation is [`sqlite::SqliteStore`].
//!
//! All trait methods use `impl Future` in their signatures so no boxing is
//! required on the hot path.

pub mod sqlite;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Author of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Terminal status recorded in the usage ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UsageStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A row in the `messages` table.
///
/// Prompt messages carry `user_id`; assistant messages carry
/// `assistant_name` and the operation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub room_id: String,
    pub role: MessageRole,
    pub user_id: Option<String>,
    pub content: String,
    pub assistant_name: Option<String>,
    pub operation_id: Option<String>,
    pub model_id: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn prompt(room_id: &str, user_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_owned(),
            role: MessageRole::User,
            user_id: Some(user_id.to_owned()),
            content: content.to_owned(),
            assistant_name: None,
            operation_id: None,
            model_id: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        room_id: &str,
        content: String,
        assistant_name: &str,
        operation_id: &str,
        model_id: &str,
        cancelled: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_owned(),
            role: MessageRole::Assistant,
            user_id: None,
            content,
            assistant_name: Some(assistant_name.to_owned()),
            operation_id: Some(operation_id.to_owned()),
            model_id: Some(model_id.to_owned()),
            cancelled,
            created_at: Utc::now(),
        }
    }
}

/// One append-only usage ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub user_id: String,
    pub room_id: String,
    pub operation_id: String,
    pub model_id: String,
    pub tokens_used: u32,
    pub status: UsageStatus,
    pub created_at: DateTime<Utc>,
}

/// Room provisioning.
pub trait RoomStore: Send + Sync + 'static {
    fn get_room(
        &self,
        room_id: &str,
    ) -> impl Future<Output = Result<Option<RoomRecord>, sqlx::Error>> + Send;

    /// Resolve the user's default room, creating it on first use.
    fn default_room(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<RoomRecord, sqlx::Error>> + Send;
}

pub trait MessageStore: Send + Sync + 'static {
    fn insert_message(
        &self,
        record: &MessageRecord,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Messages of a room, oldest first.
    fn list_room_messages(
        &self,
        room_id: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<MessageRecord>, sqlx::Error>> + Send;
}

/// Per-user assistant display name.
pub trait IdentityStore: Send + Sync + 'static {
    fn get_assistant_name(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<String>, sqlx::Error>> + Send;

    /// Last write wins.
    fn set_assistant_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

pub trait UsageStore: Send + Sync + 'static {
    fn append_usage(
        &self,
        record: &UsageRecord,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn list_usage(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<UsageRecord>, sqlx::Error>> + Send;
}

/// Everything the orchestrator persists through.
pub trait ChatStore: RoomStore + MessageStore + IdentityStore + UsageStore {}

impl<T> ChatStore for T where T: RoomStore + MessageStore + IdentityStore + UsageStore {}
