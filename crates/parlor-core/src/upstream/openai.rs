//! OpenAI-compatible `/chat/completions` streaming provider.
//!
//! The response body is Server-Sent Events: one `data: {json}` line per
//! delta, terminated by `data: [DONE]`.  A reader task turns those lines into
//! [`StreamChunk`]s and races every read against the operation's
//! [`CancelSignal`], so a cancel drops the HTTP response (closing the
//! connection) and yields [`StreamChunk::Cancelled`].

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{GenerationRequest, Provider, STREAM_BUFFER, StreamChunk, TokenStream};
use crate::error::UpstreamError;
use crate::registry::CancelSignal;

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// Maximum idle time between two body reads.
    pub read_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Use a pre-built client; the config's timeouts are then ignored.
    pub fn with_client(client: reqwest::Client, config: OpenAiConfig) -> Self {
        Self { client, config }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn open(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> Result<TokenStream, UpstreamError> {
        let body = ChatRequest::from(&request);
        let mut http = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: summarize_error_body(&text),
            });
        }

        debug!(model = %request.model, "upstream stream opened");
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(read_stream(response, tx, cancel));
        Ok(rx)
    }
}

async fn read_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamChunk>,
    mut cancel: CancelSignal,
) {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut usage = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("upstream stream aborted by cancel");
                let _ = tx.send(StreamChunk::Cancelled).await;
                return;
            }
            _ = tx.closed() => return,
            next = body.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(error = %e, "upstream stream read failed");
                let _ = tx
                    .send(StreamChunk::Error(format!("upstream stream failed: {e}")))
                    .await;
                return;
            }
            None => break,
        };

        buffer.extend_from_slice(&bytes);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if handle_line(line.trim(), &tx, &mut usage).await.is_break() {
                return;
            }
        }
    }

    // Body closed without `[DONE]`; flush a final unterminated line.
    let rest = String::from_utf8_lossy(&buffer).into_owned();
    if handle_line(rest.trim(), &tx, &mut usage).await.is_break() {
        return;
    }
    let _ = tx.send(StreamChunk::Done { usage }).await;
}

async fn handle_line(
    line: &str,
    tx: &mpsc::Sender<StreamChunk>,
    usage: &mut Option<u32>,
) -> ControlFlow<()> {
    let Some(frame) = decode_line(line) else {
        return ControlFlow::Continue(());
    };
    match frame {
        Frame::Delta {
            content,
            completion_tokens,
        } => {
            if completion_tokens.is_some() {
                *usage = completion_tokens;
            }
            match content {
                Some(text) if !text.is_empty() => {
                    if tx.send(StreamChunk::Token(text)).await.is_err() {
                        // Receiver gone: the operation already finished.
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                }
                _ => ControlFlow::Continue(()),
            }
        }
        Frame::Done => {
            let _ = tx.send(StreamChunk::Done { usage: *usage }).await;
            ControlFlow::Break(())
        }
        Frame::Error(message) => {
            let _ = tx.send(StreamChunk::Error(message)).await;
            ControlFlow::Break(())
        }
    }
}

/// One decoded SSE line.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Delta {
        content: Option<String>,
        completion_tokens: Option<u32>,
    },
    Done,
    Error(String),
}

/// Decode one trimmed SSE line.  Comments, `event:` lines and blank lines
/// yield `None`.
fn decode_line(line: &str) -> Option<Frame> {
    let payload = line.strip_prefix("data:").map(str::trim_start)?;
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(Frame::Done);
    }

    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) if chunk.error.is_none() => Some(Frame::Delta {
            content: chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content),
            completion_tokens: chunk.usage.map(|u| u.completion_tokens),
        }),
        _ => Some(Frame::Error(format_stream_error(payload))),
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))?;
    Some(summary.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn format_stream_error(payload: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => match extract_error_summary(&value) {
            Some(summary) if !summary.is_empty() => format!("provider error: {summary}"),
            _ => format!("malformed stream frame: {}", truncate(payload)),
        },
        Err(_) => format!("malformed stream frame: {}", truncate(payload)),
    }
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".into();
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| extract_error_summary(&value))
        .filter(|summary| !summary.is_empty())
        .unwrap_or_else(|| truncate(trimmed))
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_owned(),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> From<&'a GenerationRequest> for ChatRequest<'a> {
    fn from(req: &'a GenerationRequest) -> Self {
        Self {
            model: &req.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &req.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &req.prompt,
                },
            ],
            stream: true,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    completion_tokens: u32,
}
