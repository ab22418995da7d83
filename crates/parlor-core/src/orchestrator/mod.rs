//! Generation orchestrator.
//!
//! [`Orchestrator::start_query`] validates, persists the prompt, registers
//! the operation and spawns one task per operation.  That task opens the
//! upstream stream, relays fragments, applies directives and finalizes
//! exactly once.  Cancellation goes through the [`OperationRegistry`]; the
//! task removes its own entry before finalize writes begin, so a cancel
//! racing finalize sees `false`.

mod operation;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

pub use operation::{Ending, GenerationOperation, Outcome, Phase};

use crate::coordinator::Coordinator;
use crate::directive;
use crate::error::QueryError;
use crate::gate::AdmissionGate;
use crate::push::Broadcaster;
use crate::registry::{CancelSignal, OperationRegistry, cancel_pair};
use crate::store::ChatStore;
use crate::upstream::{GenerationRequest, Provider, StreamChunk, TokenStream};

/// Static parameters of every operation.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model name sent upstream and recorded on messages and usage.
    pub model_id: String,
    pub system_prompt: String,
    pub default_assistant_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_prompt_bytes: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model_id: "gpt-4o-mini".into(),
            system_prompt: "You are a helpful assistant in a group chat.".into(),
            default_assistant_name: "Assistant".into(),
            temperature: 0.7,
            max_tokens: 1024,
            max_prompt_bytes: 128 * 1024,
        }
    }
}

/// Returned by `start_query` before any generation happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAck {
    pub operation_id: String,
    pub room_id: String,
    pub prompt_message_id: String,
}

/// Acknowledgement plus the task driving the operation.
#[derive(Debug)]
pub struct QueryTicket {
    pub ack: QueryAck,
    task: JoinHandle<Outcome>,
}

impl QueryTicket {
    /// Wait for the operation to finalize.
    pub async fn wait(self) -> Result<Outcome, JoinError> {
        self.task.await
    }

    /// Detach from the task; the operation keeps running.
    pub fn into_ack(self) -> QueryAck {
        self.ack
    }
}

struct Inner<S> {
    registry: OperationRegistry,
    coordinator: Coordinator<S>,
    provider: Arc<dyn Provider>,
    gate: Arc<dyn AdmissionGate>,
    settings: OrchestratorSettings,
    active: Arc<watch::Sender<usize>>,
}

pub struct Orchestrator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.inner.registry)
            .field("model_id", &self.inner.settings.model_id)
            .finish_non_exhaustive()
    }
}

impl<S: ChatStore> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        push: Arc<dyn Broadcaster>,
        provider: Arc<dyn Provider>,
        gate: Arc<dyn AdmissionGate>,
        settings: OrchestratorSettings,
    ) -> Self {
        let coordinator = Coordinator::new(
            store,
            push,
            settings.model_id.clone(),
            settings.default_assistant_name.clone(),
        );
        let (active, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                registry: OperationRegistry::new(),
                coordinator,
                provider,
                gate,
                settings,
                active: Arc::new(active),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Operations whose task has not exited yet.
    pub fn active_operations(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Accept a prompt.  On success the prompt is persisted and the operation
    /// is live; everything after this arrives on the user's private channel.
    pub async fn start_query(
        &self,
        user_id: &str,
        room_id: Option<&str>,
        prompt: &str,
    ) -> Result<QueryTicket, QueryError> {
        if self.inner.registry.is_closed() {
            return Err(QueryError::ShuttingDown);
        }
        self.validate(prompt)?;
        self.inner
            .gate
            .admit(user_id, prompt)
            .await
            .map_err(|rejection| QueryError::Validation(rejection.0))?;

        let coordinator = &self.inner.coordinator;
        let room_id = coordinator.resolve_room(user_id, room_id).await?;
        let assistant_name = coordinator.assistant_name(user_id).await?;
        let prompt_message = coordinator.persist_prompt(&room_id, user_id, prompt).await?;

        let operation_id = Uuid::new_v4().to_string();
        let (handle, signal) = cancel_pair();
        // Counted before registering, so a drain that closes the registry
        // after this point also waits for the task.
        let guard = ActiveGuard::enter(&self.inner.active);
        self.inner
            .registry
            .register(operation_id.clone(), user_id, handle)?;

        let op = GenerationOperation::new(
            operation_id.clone(),
            user_id,
            room_id.clone(),
            prompt,
            assistant_name,
        );
        let inner = Arc::clone(&self.inner);
        let span = info_span!("operation", operation_id = %operation_id, user_id = %user_id);
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                inner.drive(op, signal).await
            }
            .instrument(span),
        );

        info!(operation_id = %operation_id, user_id, room_id = %room_id, "query started");
        Ok(QueryTicket {
            ack: QueryAck {
                operation_id,
                room_id,
                prompt_message_id: prompt_message.id,
            },
            task,
        })
    }

    /// Cancel a live operation started by `user_id`.  `false` means it
    /// already finished, never existed or belongs to someone else.
    pub fn cancel_query(&self, user_id: &str, operation_id: &str) -> bool {
        let cancelled = self.inner.registry.cancel_owned(operation_id, user_id);
        if cancelled {
            info!(operation_id, user_id, "cancel requested");
        }
        cancelled
    }

    /// Stop accepting prompts, cancel every live operation and wait up to
    /// `grace` for their tasks to finish finalizing.  Returns `true` if
    /// everything drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let signalled = self.inner.registry.close();
        info!(signalled, "draining operations");

        let mut active = self.inner.active.subscribe();
        let drained = tokio::time::timeout(grace, active.wait_for(|n| *n == 0)).await;
        match drained {
            Ok(Ok(_)) => true,
            _ => {
                warn!(
                    remaining = self.active_operations(),
                    "operations still running after shutdown grace"
                );
                false
            }
        }
    }

    fn validate(&self, prompt: &str) -> Result<(), QueryError> {
        if prompt.trim().is_empty() {
            return Err(QueryError::Validation("prompt is empty".into()));
        }
        let max = self.inner.settings.max_prompt_bytes;
        if prompt.len() > max {
            return Err(QueryError::Validation(format!(
                "prompt is {} bytes, limit is {max}",
                prompt.len()
            )));
        }
        Ok(())
    }
}

impl<S: ChatStore> Inner<S> {
    async fn drive(&self, mut op: GenerationOperation, mut cancel: CancelSignal) -> Outcome {
        let request = GenerationRequest {
            model: self.settings.model_id.clone(),
            system_prompt: directive::system_instructions(
                &self.settings.system_prompt,
                &op.assistant_name,
            ),
            prompt: op.prompt.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let upstream_cancel = cancel.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.provider.open(request, upstream_cancel) => Some(opened),
        };

        let ending = match opened {
            None => Ending::Cancelled,
            Some(Err(e)) => {
                warn!(operation_id = %op.operation_id, error = %e, "upstream call failed to open");
                Ending::Failed(e.to_string())
            }
            Some(Ok(stream)) => {
                op.advance(Phase::Streaming);
                self.pump(&mut op, stream, &mut cancel).await
            }
        };

        self.registry.remove(&op.operation_id);
        self.coordinator.finalize(&mut op, ending).await
    }

    async fn pump(
        &self,
        op: &mut GenerationOperation,
        mut stream: TokenStream,
        cancel: &mut CancelSignal,
    ) -> Ending {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                chunk = stream.recv() => chunk,
            };

            match chunk {
                Some(StreamChunk::Token(fragment)) => {
                    op.push_fragment(&fragment);
                    self.coordinator.partial(op, &fragment);
                    if let Some(directive) = op.take_directive() {
                        self.coordinator.apply_directive(op, directive).await;
                    }
                }
                Some(StreamChunk::Done { usage }) => {
                    op.reported_usage = usage;
                    return Ending::Completed;
                }
                Some(StreamChunk::Cancelled) => return Ending::Cancelled,
                Some(StreamChunk::Error(message)) => {
                    warn!(
                        operation_id = %op.operation_id,
                        error = %message,
                        "upstream stream failed"
                    );
                    return Ending::Failed(message);
                }
                None => {
                    warn!(
                        operation_id = %op.operation_id,
                        "upstream stream closed without a terminal signal"
                    );
                    return Ending::Failed("upstream stream closed unexpectedly".into());
                }
            }
        }
    }
}

/// Counts a running operation task until dropped.
struct ActiveGuard(Arc<watch::Sender<usize>>);

impl ActiveGuard {
    fn enter(active: &Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}
