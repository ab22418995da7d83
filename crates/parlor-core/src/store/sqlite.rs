//! SQLite implementation of the store traits.
//!
//! Migrations are embedded at compile time from `crates/parlor-core/migrations`
//! and run by [`SqliteStore::connect`].  Queries use the runtime-checked
//! `sqlx::query` form so no `DATABASE_URL` is needed to build.  Timestamps
//! are stored as RFC 3339 text.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use super::{
    IdentityStore, MessageRecord, MessageRole, MessageStore, RoomRecord, RoomStore, UsageRecord,
    UsageStatus, UsageStore,
};

const DEFAULT_ROOM_TITLE: &str = "Assistant";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://parlor.db`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    /// A private in-memory database.  A single connection that is never
    /// recycled, because each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

fn decode_error(column: &str, raw: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: format!("unexpected value {raw:?}").into(),
    }
}

// ── RoomStore ─────────────────────────────────────────────────────────────────

type RoomRow = (String, String, String, String);

fn room_from_row((id, owner_id, title, created_at): RoomRow) -> RoomRecord {
    RoomRecord {
        id,
        owner_id,
        title,
        created_at: parse_time(&created_at),
    }
}

impl RoomStore for SqliteStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, sqlx::Error> {
        let row: Option<RoomRow> =
            sqlx::query_as("SELECT id, owner_id, title, created_at FROM rooms WHERE id = ?1")
                .bind(room_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(room_from_row))
    }

    async fn default_room(&self, user_id: &str) -> Result<RoomRecord, sqlx::Error> {
        // OR IGNORE: a concurrent first query from the same user may have
        // created it already; the partial unique index keeps one.
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO rooms (id, owner_id, title, is_default, created_at) \
             VALUES (?1, ?2, ?3, 1, ?4)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(DEFAULT_ROOM_TITLE)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            debug!(user_id, room_id = %id, "created default room");
        }

        let row: RoomRow = sqlx::query_as(
            "SELECT id, owner_id, title, created_at FROM rooms \
             WHERE owner_id = ?1 AND is_default = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(room_from_row(row))
    }
}

// ── MessageStore ──────────────────────────────────────────────────────────────

type MessageRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    String,
);

fn message_from_row(row: MessageRow) -> Result<MessageRecord, sqlx::Error> {
    let (
        id,
        room_id,
        role,
        user_id,
        content,
        assistant_name,
        operation_id,
        model_id,
        cancelled,
        created_at,
    ) = row;
    let role = role
        .parse::<MessageRole>()
        .map_err(|_| decode_error("role", &role))?;
    Ok(MessageRecord {
        id,
        room_id,
        role,
        user_id,
        content,
        assistant_name,
        operation_id,
        model_id,
        cancelled,
        created_at: parse_time(&created_at),
    })
}

impl MessageStore for SqliteStore {
    async fn insert_message(&self, record: &MessageRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO messages \
             (id, room_id, role, user_id, content, assistant_name, operation_id, model_id, cancelled, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&record.id)
        .bind(&record.room_id)
        .bind(record.role.as_ref())
        .bind(&record.user_id)
        .bind(&record.content)
        .bind(&record.assistant_name)
        .bind(&record.operation_id)
        .bind(&record.model_id)
        .bind(record.cancelled)
        .bind(timestamp(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_room_messages(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, sqlx::Error> {
        // Newest `limit` rows, returned oldest first.
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, room_id, role, user_id, content, assistant_name, operation_id, model_id, cancelled, created_at \
             FROM (SELECT *, rowid AS seq FROM messages WHERE room_id = ?1 \
                   ORDER BY created_at DESC, seq DESC LIMIT ?2) \
             ORDER BY created_at, seq",
        )
        .bind(room_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }
}

// ── IdentityStore ─────────────────────────────────────────────────────────────

impl IdentityStore for SqliteStore {
    async fn get_assistant_name(&self, user_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT display_name FROM assistant_identities WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(name,)| name))
    }

    async fn set_assistant_name(&self, user_id: &str, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO assistant_identities (user_id, display_name, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 display_name = excluded.display_name, \
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(name)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── UsageStore ────────────────────────────────────────────────────────────────

type UsageRow = (String, String, String, String, i64, String, String);

impl UsageStore for SqliteStore {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO usage_records \
             (user_id, room_id, operation_id, model_id, tokens_used, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&record.user_id)
        .bind(&record.room_id)
        .bind(&record.operation_id)
        .bind(&record.model_id)
        .bind(i64::from(record.tokens_used))
        .bind(record.status.as_ref())
        .bind(timestamp(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageRecord>, sqlx::Error> {
        let rows: Vec<UsageRow> = sqlx::query_as(
            "SELECT user_id, room_id, operation_id, model_id, tokens_used, status, created_at \
             FROM usage_records WHERE user_id = ?1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(user_id, room_id, operation_id, model_id, tokens_used, status, created_at)| {
                    let status = status
                        .parse::<UsageStatus>()
                        .map_err(|_| decode_error("status", &status))?;
                    Ok(UsageRecord {
                        user_id,
                        room_id,
                        operation_id,
                        model_id,
                        tokens_used: u32::try_from(tokens_used).unwrap_or(u32::MAX),
                        status,
                        created_at: parse_time(&created_at),
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.expect("in-memory store")
    }

    #[tokio::test]
    async fn default_room_is_created_once() {
        let store = store().await;
        let first = store.default_room("alice").await.expect("create");
        let second = store.default_room("alice").await.expect("resolve");
        assert_eq!(first.id, second.id);
        assert_eq!(first.owner_id, "alice");

        let other = store.default_room("bob").await.expect("create");
        assert_ne!(other.id, first.id);
        assert_eq!(store.get_room(&first.id).await.expect("get"), Some(first));
    }

    #[tokio::test]
    async fn unknown_room_is_none() {
        let store = store().await;
        assert_eq!(store.get_room("nope").await.expect("get"), None);
    }

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let store = store().await;
        let room = store.default_room("alice").await.expect("room");

        let prompt = MessageRecord::prompt(&room.id, "alice", "hello");
        store.insert_message(&prompt).await.expect("insert prompt");
        let reply = MessageRecord::assistant(&room.id, "hi!".into(), "Jarvis", "op-1", "m", true);
        store.insert_message(&reply).await.expect("insert reply");

        let listed = store.list_room_messages(&room.id, 50).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].role, MessageRole::User);
        assert_eq!(listed[0].user_id.as_deref(), Some("alice"));
        assert_eq!(listed[1].role, MessageRole::Assistant);
        assert_eq!(listed[1].assistant_name.as_deref(), Some("Jarvis"));
        assert_eq!(listed[1].operation_id.as_deref(), Some("op-1"));
        assert!(listed[1].cancelled);

        let newest = store.list_room_messages(&room.id, 1).await.expect("list");
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].id, reply.id);
    }

    #[tokio::test]
    async fn second_assistant_message_per_operation_is_rejected() {
        let store = store().await;
        let room = store.default_room("alice").await.expect("room");
        let first = MessageRecord::assistant(&room.id, "a".into(), "A", "op-1", "m", false);
        let second = MessageRecord::assistant(&room.id, "b".into(), "A", "op-1", "m", false);

        store.insert_message(&first).await.expect("first insert");
        assert!(store.insert_message(&second).await.is_err());
    }

    #[tokio::test]
    async fn assistant_name_is_last_write_wins() {
        let store = store().await;
        assert_eq!(store.get_assistant_name("alice").await.expect("get"), None);

        store.set_assistant_name("alice", "Jarvis").await.expect("set");
        store.set_assistant_name("alice", "Friday").await.expect("set");
        assert_eq!(
            store.get_assistant_name("alice").await.expect("get").as_deref(),
            Some("Friday")
        );
        assert_eq!(store.get_assistant_name("bob").await.expect("get"), None);
    }

    #[tokio::test]
    async fn usage_is_append_only() {
        let store = store().await;
        for (op, status) in [("op-1", UsageStatus::Completed), ("op-2", UsageStatus::Cancelled)] {
            store
                .append_usage(&UsageRecord {
                    user_id: "alice".into(),
                    room_id: "r".into(),
                    operation_id: op.into(),
                    model_id: "m".into(),
                    tokens_used: 7,
                    status,
                    created_at: Utc::now(),
                })
                .await
                .expect("append");
        }

        let usage = store.list_usage("alice").await.expect("list");
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].operation_id, "op-1");
        assert_eq!(usage[1].status, UsageStatus::Cancelled);
        assert_eq!(usage[1].tokens_used, 7);
    }
}
