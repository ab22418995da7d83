//! Persistence & broadcast coordinator.
//!
//! Everything an operation writes or announces goes through here: the prompt
//! message at start, `partial` events while streaming, the identity rename
//! when a directive appears, and the single finalize step.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::directive::Directive;
use crate::error::QueryError;
use crate::orchestrator::{Ending, GenerationOperation, Outcome};
use crate::push::{Broadcaster, MessageView, PrivateEvent, RoomEvent};
use crate::store::{ChatStore, MessageRecord, UsageRecord};

pub struct Coordinator<S> {
    store: Arc<S>,
    push: Arc<dyn Broadcaster>,
    model_id: String,
    default_assistant_name: String,
}

impl<S: ChatStore> Coordinator<S> {
    pub fn new(
        store: Arc<S>,
        push: Arc<dyn Broadcaster>,
        model_id: impl Into<String>,
        default_assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            push,
            model_id: model_id.into(),
            default_assistant_name: default_assistant_name.into(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Explicit rooms must exist; no room means the user's default room.
    pub async fn resolve_room(
        &self,
        user_id: &str,
        room_id: Option<&str>,
    ) -> Result<String, QueryError> {
        match room_id {
            Some(id) => self
                .store
                .get_room(id)
                .await?
                .map(|room| room.id)
                .ok_or_else(|| QueryError::RoomNotFound(id.to_owned())),
            None => Ok(self.store.default_room(user_id).await?.id),
        }
    }

    pub async fn persist_prompt(
        &self,
        room_id: &str,
        user_id: &str,
        prompt: &str,
    ) -> Result<MessageRecord, QueryError> {
        let record = MessageRecord::prompt(room_id, user_id, prompt);
        self.store.insert_message(&record).await?;
        Ok(record)
    }

    /// The user's persisted assistant name, or the configured default.
    pub async fn assistant_name(&self, user_id: &str) -> Result<String, QueryError> {
        Ok(self
            .store
            .get_assistant_name(user_id)
            .await?
            .unwrap_or_else(|| self.default_assistant_name.clone()))
    }

    /// Relay one raw fragment to the requester only.
    pub fn partial(&self, op: &GenerationOperation, chunk: &str) {
        self.push.send_to_user(
            &op.user_id,
            PrivateEvent::Partial {
                operation_id: op.operation_id.clone(),
                chunk: chunk.to_owned(),
            },
        );
    }

    /// Apply a detected directive.  A failed identity write is logged and the
    /// new name is still used for this operation.
    pub async fn apply_directive(&self, op: &mut GenerationOperation, directive: Directive) {
        match directive {
            Directive::Rename { name } => {
                if let Err(e) = self.store.set_assistant_name(&op.user_id, &name).await {
                    warn!(
                        operation_id = %op.operation_id,
                        user_id = %op.user_id,
                        error = %e,
                        "failed to persist assistant rename"
                    );
                }
                info!(
                    operation_id = %op.operation_id,
                    from = %op.assistant_name,
                    to = %name,
                    "assistant renamed"
                );
                op.assistant_name = name;
            }
        }
    }

    /// The terminal step.  Called exactly once per operation, after its
    /// registry entry is gone.
    pub async fn finalize(&self, op: &mut GenerationOperation, ending: Ending) -> Outcome {
        op.advance(crate::orchestrator::Phase::Finalizing);

        // The orchestrator scans after every fragment; this covers callers
        // that hand over an operation without scanning it.
        if let Some(directive) = op.take_directive() {
            self.apply_directive(op, directive).await;
        }

        let mut ending = ending;
        let cancelled = ending != Ending::Completed;
        let text = op.clean_text();
        let mut saved_message_id = None;

        if !text.trim().is_empty() {
            let record = MessageRecord::assistant(
                &op.room_id,
                text,
                &op.assistant_name,
                &op.operation_id,
                &self.model_id,
                cancelled,
            );
            match self.store.insert_message(&record).await {
                Ok(()) => {
                    self.record_usage(op, &ending).await;
                    let event = RoomEvent::NewMessage(MessageView::from(&record));
                    self.push.send_to_room(&op.room_id, event);
                    saved_message_id = Some(record.id);
                }
                Err(e) => {
                    error!(
                        operation_id = %op.operation_id,
                        error = %e,
                        "failed to persist assistant message"
                    );
                    ending = Ending::Failed("failed to save the assistant reply".into());
                }
            }
        }

        let terminal = match &ending {
            Ending::Failed(message) => PrivateEvent::Error {
                operation_id: op.operation_id.clone(),
                message: message.clone(),
            },
            Ending::Completed | Ending::Cancelled => PrivateEvent::Done {
                operation_id: op.operation_id.clone(),
                saved_message_id: saved_message_id.clone(),
                cancelled,
                room_id: op.room_id.clone(),
            },
        };
        self.push.send_to_user(&op.user_id, terminal);

        let phase = ending.phase();
        op.advance(phase);
        info!(
            operation_id = %op.operation_id,
            user_id = %op.user_id,
            room_id = %op.room_id,
            phase = %phase,
            saved = saved_message_id.is_some(),
            tokens = op.tokens_used(),
            "operation finalized"
        );

        Outcome {
            operation_id: op.operation_id.clone(),
            phase,
            saved_message_id,
            assistant_name: op.assistant_name.clone(),
            tokens_consumed: op.tokens_used(),
        }
    }

    async fn record_usage(&self, op: &GenerationOperation, ending: &Ending) {
        let record = UsageRecord {
            user_id: op.user_id.clone(),
            room_id: op.room_id.clone(),
            operation_id: op.operation_id.clone(),
            model_id: self.model_id.clone(),
            tokens_used: op.tokens_used(),
            status: ending.usage_status(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_usage(&record).await {
            warn!(operation_id = %op.operation_id, error = %e, "failed to append usage record");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::orchestrator::Phase;
    use crate::push::PushHub;
    use crate::store::sqlite::SqliteStore;
    use crate::store::{IdentityStore, MessageRole, MessageStore, RoomStore, UsageStore};

    async fn setup() -> (Coordinator<SqliteStore>, Arc<SqliteStore>, Arc<PushHub>, String) {
        let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
        let hub = Arc::new(PushHub::new());
        let coordinator =
            Coordinator::new(Arc::clone(&store), hub.clone(), "test-model", "Assistant");
        let room = store.default_room("alice").await.expect("room");
        (coordinator, store, hub, room.id)
    }

    fn operation(room_id: &str) -> GenerationOperation {
        GenerationOperation::new(
            "op-1".into(),
            "alice",
            room_id.to_owned(),
            "hi",
            "Assistant".into(),
        )
    }

    #[tokio::test]
    async fn finalize_applies_an_unscanned_marker() {
        let (coordinator, store, hub, room_id) = setup().await;
        let mut private = hub.subscribe_user("alice");
        let mut room = hub.subscribe_room(&room_id);

        let mut op = operation(&room_id);
        op.push_fragment("Sure. <<NAME_CHANGE:");
        op.push_fragment("Friday>>");
        let outcome = coordinator.finalize(&mut op, Ending::Completed).await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(outcome.assistant_name, "Friday");
        assert_eq!(
            store.get_assistant_name("alice").await.expect("get").as_deref(),
            Some("Friday")
        );

        let messages = store.list_room_messages(&room_id, 10).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].content, "Sure. ");
        assert_eq!(messages[0].assistant_name.as_deref(), Some("Friday"));

        let RoomEvent::NewMessage(view) = room.try_recv().expect("broadcast");
        assert_eq!(view.assistant_name.as_deref(), Some("Friday"));
        assert!(matches!(
            private.try_recv(),
            Ok(PrivateEvent::Done { cancelled: false, saved_message_id: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn whitespace_left_after_the_marker_counts_as_empty() {
        let (coordinator, store, hub, room_id) = setup().await;
        let mut private = hub.subscribe_user("alice");
        let mut room = hub.subscribe_room(&room_id);

        let mut op = operation(&room_id);
        op.push_fragment("<<NAME_CHANGE:Bo>>");
        op.push_fragment("  \n");
        let outcome = coordinator.finalize(&mut op, Ending::Completed).await;

        assert_eq!(outcome.assistant_name, "Bo");
        assert_eq!(outcome.saved_message_id, None);
        assert!(store.list_room_messages(&room_id, 10).await.expect("list").is_empty());
        assert!(store.list_usage("alice").await.expect("usage").is_empty());
        assert!(room.try_recv().is_err());
        assert_eq!(
            private.try_recv().expect("terminal event"),
            PrivateEvent::Done {
                operation_id: "op-1".into(),
                saved_message_id: None,
                cancelled: false,
                room_id: room_id.clone(),
            }
        );
    }
}
