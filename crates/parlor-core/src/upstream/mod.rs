//! Upstream stream client.
//!
//! A [`Provider`] opens one cancellable streaming call per operation and hands
//! back a [`TokenStream`].  Every stream ends with exactly one of the three
//! terminal chunks ([`StreamChunk::Done`], [`StreamChunk::Cancelled`],
//! [`StreamChunk::Error`]); callers must be able to tell them apart because
//! they lead to different persistence.

pub mod openai;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::registry::CancelSignal;

/// Capacity of the channel between a provider's reader task and the operation.
pub const STREAM_BUFFER: usize = 64;

/// A single item read from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A fragment of generated text.
    Token(String),
    /// Natural end of stream.  `usage` is the provider-reported completion
    /// token count, when it sent one.
    Done { usage: Option<u32> },
    /// The caller's cancellation was observed and the call aborted.
    Cancelled,
    /// Transport or provider failure after the stream was established.
    Error(String),
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Token(_))
    }
}

/// Receiving end of an open upstream stream.
pub type TokenStream = mpsc::Receiver<StreamChunk>;

/// Everything the provider needs to generate one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    /// System instructions, including the directive grammar.
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A text-generation provider capable of streaming.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Open the streaming call.
    ///
    /// Returns once the upstream has accepted the request; failures to get
    /// that far are an [`UpstreamError`].  After that every outcome arrives
    /// through the returned stream.  `cancel` aborts the call cooperatively.
    async fn open(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> Result<TokenStream, UpstreamError>;
}
