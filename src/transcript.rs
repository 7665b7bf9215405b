//! Conversation history and the rendered transcript
//!
//! Two separate stores:
//! - `History`: the user/assistant turns sent to the model as context.
//!   Commands and notices never land here.
//! - `Transcript`: what the user sees. Driven only through the
//!   `TranscriptSink` capability so the session logic stays independent
//!   of how it is drawn.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Preview width used by `/history`
pub const PREVIEW_CHARS: usize = 50;

/// Role of a history turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A message in the conversation, in the wire shape the chat endpoint takes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Append-only ordered log of turns. Emptied only by `/reset`.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<ChatMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.messages.push(msg);
    }

    /// Exact context for the next request
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// One line per turn: `1. [user] first 50 chars...`
    pub fn previews(&self) -> Vec<String> {
        self.messages
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. [{}] {}", i + 1, m.role.as_str(), preview(&m.content, PREVIEW_CHARS)))
            .collect()
    }
}

/// Truncate on a char boundary, flattening newlines
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

// ═══════════════════════════════════════════════════════════════
// Transcript sink
// ═══════════════════════════════════════════════════════════════

/// Who a rendered entry is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
    /// Command output and status notices
    System,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "USER>",
            Speaker::Assistant => "AI>",
            Speaker::System => "SYSTEM>",
        }
    }
}

/// Handle to a rendered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

/// Progress indicator drawn over the chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    Loading { model: String, elapsed: String },
    Generating,
}

/// Rendering capability the session controller writes through
pub trait TranscriptSink {
    /// Add an entry. Assistant entries stay open for `update_in_progress`.
    fn append_entry(&mut self, speaker: Speaker, content: &str) -> EntryId;

    /// Replace the content of an open entry in place
    fn update_in_progress(&mut self, id: EntryId, text: &str);

    /// Close an entry; later updates to it are ignored
    fn finalize(&mut self, id: EntryId);

    /// Drop everything rendered so far
    fn clear(&mut self);

    fn set_overlay(&mut self, overlay: Option<Overlay>);

    fn notice(&mut self, text: &str) {
        let id = self.append_entry(Speaker::System, text);
        self.finalize(id);
    }
}

#[derive(Debug, Clone)]
pub struct RenderedEntry {
    pub id: EntryId,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub in_progress: bool,
}

impl RenderedEntry {
    /// `[HH:MM:SS]`
    pub fn stamp(&self) -> String {
        self.timestamp.format("[%H:%M:%S]").to_string()
    }
}

/// In-memory transcript drawn by the TUI
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<RenderedEntry>,
    overlay: Option<Overlay>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RenderedEntry] {
        &self.entries
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&RenderedEntry> {
        self.entries.last()
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut RenderedEntry> {
        // Open entries are almost always at the tail
        self.entries.iter_mut().rev().find(|e| e.id == id)
    }
}

impl TranscriptSink for Transcript {
    fn append_entry(&mut self, speaker: Speaker, content: &str) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(RenderedEntry {
            id,
            speaker,
            content: content.to_string(),
            timestamp: Local::now(),
            in_progress: speaker == Speaker::Assistant,
        });
        id
    }

    fn update_in_progress(&mut self, id: EntryId, text: &str) {
        if let Some(entry) = self.get_mut(id) {
            if entry.in_progress {
                entry.content.clear();
                entry.content.push_str(text);
            }
        }
    }

    fn finalize(&mut self, id: EntryId) {
        if let Some(entry) = self.get_mut(id) {
            entry.in_progress = false;
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn set_overlay(&mut self, overlay: Option<Overlay>) {
        self.overlay = overlay;
    }
}
