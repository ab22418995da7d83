//! Live operation registry.
//!
//! Maps operation ids to the cancellation handle of the task driving them.
//! Start, cancel and finalize all touch the map, so it sits behind a mutex.
//! Removing an entry is the single point that decides who owns the
//! operation's end: whoever removes it first (a cancel request or the
//! finalize path) wins, and a later cancel is a harmless `false`.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;

/// Errors produced by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Operation ids are generated server-side and never reused; hitting this
    /// means the caller registered the same id twice.
    #[error("operation already registered: {0}")]
    Duplicate(String),

    /// The registry was closed for shutdown and takes no new operations.
    #[error("registry is closed")]
    Closed,
}

/// Sending side of an operation's cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Signal cancellation.  Idempotent and valid with no receivers left.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiving side of an operation's cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is signalled.
    ///
    /// If the handle is dropped without cancelling (the operation was
    /// finalized) this never resolves.
    pub async fn cancelled(&mut self) {
        let closed = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a linked handle/signal pair, not yet cancelled.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

struct Entry {
    owner: String,
    handle: CancelHandle,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Entry>,
    closed: bool,
}

/// Tracks live operations by id.
pub struct OperationRegistry {
    slots: Mutex<Slots>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperationRegistry({} live)", self.len())
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new live operation owned by `owner`.
    pub fn register(
        &self,
        id: impl Into<String>,
        owner: impl Into<String>,
        handle: CancelHandle,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        let mut slots = self.slots();
        if slots.closed {
            return Err(RegistryError::Closed);
        }
        if slots.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let owner = owner.into();
        slots.entries.insert(id, Entry { owner, handle });
        Ok(())
    }

    /// Cancel and remove an operation.  Returns `true` if it was live.
    ///
    /// `false` means the operation already finished (or never existed); the
    /// caller should report "not found" rather than retry.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.slots().entries.remove(id);
        match removed {
            Some(entry) => {
                entry.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Like [`cancel`](Self::cancel), but only for the operation's owner.
    /// Another caller gets `false` and the operation keeps running.
    pub fn cancel_owned(&self, id: &str, owner: &str) -> bool {
        let removed = {
            let mut slots = self.slots();
            match slots.entries.get(id) {
                Some(entry) if entry.owner == owner => slots.entries.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove an operation without signalling it.  Called at the start of
    /// finalize.  Returns `true` if the entry was still present.
    pub fn remove(&self, id: &str) -> bool {
        self.slots().entries.remove(id).is_some()
    }

    /// Refuse further registrations and cancel every live operation,
    /// returning how many were signalled.
    pub fn close(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut slots = self.slots();
            slots.closed = true;
            slots.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.handle.cancel();
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
