//! parlor-core – streaming generation orchestrator.
//!
//! A prompt accepted by [`Orchestrator::start_query`] is persisted, registered
//! in the [`OperationRegistry`] and handed to a background task that reads the
//! upstream token stream, relays every fragment to the requesting user, applies
//! embedded `<<NAME_CHANGE:…>>` directives and finalizes the operation exactly
//! once into the store plus a room-wide broadcast.

pub mod coordinator;
pub mod directive;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod push;
pub mod registry;
pub mod store;
pub mod upstream;

pub use error::{QueryError, UpstreamError};
pub use orchestrator::{Orchestrator, OrchestratorSettings, Outcome, Phase, QueryAck, QueryTicket};
pub use push::{Broadcaster, PrivateEvent, PushHub, RoomEvent};
pub use registry::{OperationRegistry, RegistryError};
pub use store::sqlite::SqliteStore;
