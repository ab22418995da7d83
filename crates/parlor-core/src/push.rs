//! Push channels.
//!
//! Two scopes: a user's private channel carries `partial`/`done`/`error` for
//! that user's operations; a room channel carries only finalized assistant
//! messages.  [`Broadcaster`] is the seam the coordinator sends through;
//! [`PushHub`] is the in-process implementation the server subscribes to.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{MessageRecord, MessageRole};

/// Events on a user's private channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PrivateEvent {
    #[serde(rename_all = "camelCase")]
    Partial { operation_id: String, chunk: String },
    #[serde(rename_all = "camelCase")]
    Done {
        operation_id: String,
        saved_message_id: Option<String>,
        cancelled: bool,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Error { operation_id: String, message: String },
}

impl PrivateEvent {
    pub fn operation_id(&self) -> &str {
        match self {
            PrivateEvent::Partial { operation_id, .. }
            | PrivateEvent::Done { operation_id, .. }
            | PrivateEvent::Error { operation_id, .. } => operation_id,
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            PrivateEvent::Partial { .. } => "partial",
            PrivateEvent::Done { .. } => "done",
            PrivateEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PrivateEvent::Partial { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub operation_id: Option<String>,
    pub model_id: Option<String>,
    pub cancelled: bool,
}

/// Wire shape of a persisted message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub room_id: String,
    pub role: MessageRole,
    pub content: String,
    pub assistant_name: Option<String>,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl From<&MessageRecord> for MessageView {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            room_id: record.room_id.clone(),
            role: record.role,
            content: record.content.clone(),
            assistant_name: record.assistant_name.clone(),
            metadata: MessageMetadata {
                operation_id: record.operation_id.clone(),
                model_id: record.model_id.clone(),
                cancelled: record.cancelled,
            },
            created_at: record.created_at,
        }
    }
}

/// Events on a room channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum RoomEvent {
    NewMessage(MessageView),
}

impl RoomEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::NewMessage(_) => "newMessage",
        }
    }
}

/// Delivery to the two channel scopes.  Membership is resolved by the
/// implementation; sends never fail from the caller's point of view.
pub trait Broadcaster: Send + Sync + 'static {
    fn send_to_user(&self, user_id: &str, event: PrivateEvent);
    fn send_to_room(&self, room_id: &str, event: RoomEvent);
}

type Subscribers<E> = Mutex<HashMap<String, Vec<mpsc::UnboundedSender<E>>>>;

/// In-process fan-out.  Each subscriber gets its own unbounded FIFO queue,
/// so per-operation ordering is the order of `send_*` calls.
#[derive(Default)]
pub struct PushHub {
    users: Subscribers<PrivateEvent>,
    rooms: Subscribers<RoomEvent>,
}

impl std::fmt::Debug for PushHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushHub").finish_non_exhaustive()
    }
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_user(&self, user_id: &str) -> mpsc::UnboundedReceiver<PrivateEvent> {
        subscribe(&self.users, user_id)
    }

    pub fn subscribe_room(&self, room_id: &str) -> mpsc::UnboundedReceiver<RoomEvent> {
        subscribe(&self.rooms, room_id)
    }

    /// Number of open subscribers on a user's channel.
    pub fn user_subscribers(&self, user_id: &str) -> usize {
        count(&self.users, user_id)
    }

    pub fn room_subscribers(&self, room_id: &str) -> usize {
        count(&self.rooms, room_id)
    }
}

impl Broadcaster for PushHub {
    fn send_to_user(&self, user_id: &str, event: PrivateEvent) {
        fan_out(&self.users, user_id, event);
    }

    fn send_to_room(&self, room_id: &str, event: RoomEvent) {
        fan_out(&self.rooms, room_id, event);
    }
}

fn subscribe<E>(map: &Subscribers<E>, key: &str) -> mpsc::UnboundedReceiver<E> {
    let (tx, rx) = mpsc::unbounded_channel();
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(key.to_owned())
        .or_default()
        .push(tx);
    rx
}

fn count<E>(map: &Subscribers<E>, key: &str) -> usize {
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(key)
        .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
        .unwrap_or(0)
}

fn fan_out<E: Clone>(map: &Subscribers<E>, key: &str, event: E) {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    let Some(subs) = map.get_mut(key) else {
        return;
    };
    subs.retain(|tx| tx.send(event.clone()).is_ok());
    if subs.is_empty() {
        debug!(channel = key, "last subscriber gone");
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(op: &str, chunk: &str) -> PrivateEvent {
        PrivateEvent::Partial {
            operation_id: op.into(),
            chunk: chunk.into(),
        }
    }

    #[test]
    fn user_events_reach_only_that_user() {
        let hub = PushHub::new();
        let mut alice = hub.subscribe_user("alice");
        let mut bob = hub.subscribe_user("bob");

        hub.send_to_user("alice", partial("op-1", "hi"));

        assert_eq!(alice.try_recv().ok(), Some(partial("op-1", "hi")));
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_of_a_channel_receives_in_order() {
        let hub = PushHub::new();
        let mut tab_a = hub.subscribe_user("alice");
        let mut tab_b = hub.subscribe_user("alice");

        for chunk in ["a", "b", "c"] {
            hub.send_to_user("alice", partial("op-1", chunk));
        }

        for rx in [&mut tab_a, &mut tab_b] {
            let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
            assert_eq!(got, vec![partial("op-1", "a"), partial("op-1", "b"), partial("op-1", "c")]);
        }
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let hub = PushHub::new();
        let rx = hub.subscribe_room("room-1");
        assert_eq!(hub.room_subscribers("room-1"), 1);
        drop(rx);

        let record = MessageRecord::assistant("room-1", "x".into(), "A", "op", "m", false);
        hub.send_to_room("room-1", RoomEvent::NewMessage(MessageView::from(&record)));
        assert_eq!(hub.room_subscribers("room-1"), 0);
    }

    #[test]
    fn events_serialize_camel_case() {
        let done = PrivateEvent::Done {
            operation_id: "op-1".into(),
            saved_message_id: None,
            cancelled: true,
            room_id: "r".into(),
        };
        let json = serde_json::to_value(&done).expect("serialize");
        assert_eq!(json["type"], "done");
        assert_eq!(json["operationId"], "op-1");
        assert_eq!(json["savedMessageId"], serde_json::Value::Null);
        assert_eq!(json["roomId"], "r");

        let record = MessageRecord::assistant("r", "hello".into(), "Jarvis", "op-1", "m", false);
        let json = serde_json::to_value(RoomEvent::NewMessage(MessageView::from(&record)))
            .expect("serialize");
        assert_eq!(json["type"], "newMessage");
        assert_eq!(json["message"]["assistantName"], "Jarvis");
        assert_eq!(json["message"]["role"], "assistant");
        assert_eq!(json["message"]["metadata"]["operationId"], "op-1");
    }
}
