//! Admission gate.
//!
//! Rate limiting and content policy live outside this crate.  They are
//! consulted through [`AdmissionGate`] after local prompt validation and
//! before anything is persisted or registered.

use async_trait::async_trait;

/// Why a prompt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait AdmissionGate: Send + Sync + 'static {
    async fn admit(&self, user_id: &str, prompt: &str) -> Result<(), Rejection>;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

#[async_trait]
impl AdmissionGate for OpenGate {
    async fn admit(&self, _user_id: &str, _prompt: &str) -> Result<(), Rejection> {
        Ok(())
    }
}
