//! HTTP middleware stack: CORS, per-request trace span, caller identity.

pub mod cors;
pub mod identity;
pub mod trace;

pub use identity::CurrentUser;
