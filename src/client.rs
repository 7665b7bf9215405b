//! Ollama API client with NDJSON streaming
//!
//! Uses the native `/api` endpoints: `tags` (catalog), `ps` (resident
//! models), `generate` (warm load) and `chat` (streamed replies).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::models::{LoadedModel, ModelDescriptor};
use crate::transcript::ChatMessage;

/// Catalog and resident-set requests; loads and chats are left unbounded
const LIST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Stream events from the chat endpoint
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    /// An incremental piece of the reply
    Chunk(String),
    /// Server signalled end-of-stream
    Done,
    /// Transport or server failure mid-stream
    Error(ChatError),
}

/// Operations the session controller needs from an inference server
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Full catalog
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /// Models currently resident in memory
    async fn list_loaded(&self) -> Result<Vec<LoadedModel>>;

    /// Force the server to load weights. Returning at all means "loaded".
    async fn warm_load(&self, model: &str) -> Result<()>;

    /// Open a streamed reply for `messages`. Events arrive in order on the
    /// receiver until `Done`, `Error`, or the token is cancelled. Not
    /// restartable: retry with a new call.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// HTTP client for a local Ollama server
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base: String,
    http: reqwest::Client,
}

impl OllamaClient {
    /// `api_base` is the `/api` root, e.g. `http://localhost:11434/api`
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            base: api_base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Quick reachability check for `doctor`
    pub async fn check_connectivity(&self) -> Result<String> {
        let response = self
            .http
            .get(self.url("version"))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let version: VersionResponse = response.json().await?;
        Ok(version.version)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::Transport(format!("API error {}: {}", status, body.trim())))
}

#[async_trait]
impl ModelBackend for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let response = self.http.get(self.url("tags")).timeout(LIST_TIMEOUT).send().await?;
        let data: TagsResponse = ensure_success(response).await?.json().await?;

        Ok(data
            .models
            .into_iter()
            .map(|m| ModelDescriptor { name: m.name, size_bytes: m.size })
            .collect())
    }

    async fn list_loaded(&self) -> Result<Vec<LoadedModel>> {
        let response = self.http.get(self.url("ps")).timeout(LIST_TIMEOUT).send().await?;
        let data: PsResponse = ensure_success(response).await?.json().await?;

        Ok(data.models.into_iter().map(|m| LoadedModel { name: m.name }).collect())
    }

    async fn warm_load(&self, model: &str) -> Result<()> {
        let request = GenerateRequest { model, prompt: "", stream: false };
        let response = self.http.post(self.url("generate")).json(&request).send().await?;
        // Body carries nothing useful, but the load is only done once it arrives
        ensure_success(response).await?.bytes().await?;
        Ok(())
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        if cancel.is_cancelled() {
            return Err(ChatError::Aborted);
        }

        let (tx, rx) = mpsc::channel(256);
        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: true,
        };
        let http = self.http.clone();
        let url = self.url("chat");

        tokio::spawn(async move {
            match do_stream(&http, &url, &request, &tx, &cancel).await {
                Ok(()) => {
                    let _ = tx.send(StreamEvent::Done).await;
                }
                Err(ChatError::Aborted) => {
                    debug!(model = %request.model, "stream cancelled");
                }
                Err(e) => {
                    warn!(model = %request.model, error = %e, "stream failed");
                    let _ = tx.send(StreamEvent::Error(e)).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Perform the streaming request, forwarding content until `done`
async fn do_stream(
    http: &reqwest::Client,
    url: &str,
    request: &ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ChatError::Aborted),
        r = http.post(url).json(request).send() => r?,
    };
    let response = ensure_success(response).await?;

    let mut bytes_stream = response.bytes_stream();
    // Buffer for lines split across reads
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            c = bytes_stream.next() => c,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| ChatError::Transport(format!("stream read error: {}", e)))?;
        // Raw bytes: a multi-byte character may straddle two reads
        buffer.extend_from_slice(&chunk);

        for line in drain_lines(&mut buffer) {
            if handle_line(&line, tx).await? {
                return Ok(());
            }
        }
    }

    // Trailing object without a final newline
    let rest = String::from_utf8_lossy(&buffer).trim().to_string();
    if !rest.is_empty() {
        handle_line(&rest, tx).await?;
    }
    Ok(())
}

/// Forward one NDJSON object. Returns true once the server says `done`.
async fn handle_line(line: &str, tx: &mpsc::Sender<StreamEvent>) -> Result<bool> {
    match parse_chat_line(line)? {
        Some(ChatLine { content, done }) => {
            if !content.is_empty() && tx.send(StreamEvent::Chunk(content)).await.is_err() {
                // Receiver gone; nobody is listening any more
                return Ok(true);
            }
            Ok(done)
        }
        None => Ok(false),
    }
}

/// Take every complete line out of `buffer`, leaving any partial tail.
/// Lines are decoded only once whole.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
        let line = String::from_utf8_lossy(&raw[..newline_pos]).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

#[derive(Debug, PartialEq)]
pub(crate) struct ChatLine {
    pub content: String,
    pub done: bool,
}

/// Decode one stream object. Unparseable lines are skipped; an `error`
/// field is a server failure.
pub(crate) fn parse_chat_line(line: &str) -> Result<Option<ChatLine>> {
    let Ok(chunk) = serde_json::from_str::<ChatChunk>(line) else {
        debug!(line, "skipping unparseable stream line");
        return Ok(None);
    };
    if let Some(error) = chunk.error {
        return Err(ChatError::Transport(error));
    }
    Ok(Some(ChatLine {
        content: chunk.message.map(|m| m.content).unwrap_or_default(),
        done: chunk.done,
    }))
}

// ═══════════════════════════════════════════════════════════════
// API Types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsEntry>,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}
