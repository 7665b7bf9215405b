//! User Story Integration Tests
//!
//! These tests trace complete chat workflows against a scripted backend
//! to verify the session behaves correctly from the user's perspective.
//!
//! Each test represents a real user story:
//! - "As a user, I want to..."
//! - Tests verify what ends up on screen and in the model context
//! - Steps are logged for debugging

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use tokyo_chat::client::{ModelBackend, StreamEvent};
use tokyo_chat::error::{ChatError, Result};
use tokyo_chat::models::{LoadedModel, ModelDescriptor};
use tokyo_chat::session::{SessionController, STOP_MARKER};
use tokyo_chat::timer::LoadingTimer;
use tokyo_chat::transcript::{ChatMessage, Overlay, Role, Speaker, Transcript};

/// Test helper to capture and display trace logs
struct TestTracer {
    name: String,
    logs: Vec<String>,
}

impl TestTracer {
    fn new(name: &str) -> Self {
        eprintln!("\n╔═══════════════════════════════════════════════════════════════");
        eprintln!("║ USER STORY: {}", name);
        eprintln!("╚═══════════════════════════════════════════════════════════════\n");
        Self {
            name: name.to_string(),
            logs: vec![],
        }
    }

    fn step(&mut self, description: &str) {
        let msg = format!("  → {}", description);
        eprintln!("{}", msg);
        self.logs.push(msg);
    }

    fn expect(&mut self, condition: bool, description: &str) {
        let status = if condition { "✓" } else { "✗" };
        let msg = format!("    {} {}", status, description);
        eprintln!("{}", msg);
        self.logs.push(msg);
        assert!(condition, "FAILED: {}", description);
    }

    fn done(&self) {
        eprintln!("\n  ══════════════════════════════════════════════════════");
        eprintln!("  ✓ Story completed: {} ({} steps)", self.name, self.logs.len());
        eprintln!();
    }
}

// ═══════════════════════════════════════════════════════════════
// Scripted backend
// ═══════════════════════════════════════════════════════════════

/// How the next `stream_chat` call behaves
enum Script {
    /// Deliver these events, then close
    Events(Vec<StreamEvent>),
    /// Deliver these chunks and keep the stream open
    Open(Vec<&'static str>),
    /// Fail before any stream exists
    Refuse(ChatError),
}

#[derive(Default)]
struct FakeBackend {
    catalog: Vec<ModelDescriptor>,
    catalog_error: Option<ChatError>,
    warm_gate: Option<Arc<Notify>>,
    warm_error: Option<ChatError>,
    scripts: Mutex<VecDeque<Script>>,
    open_streams: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    sent_context: Mutex<Vec<Vec<ChatMessage>>>,
    warm_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl FakeBackend {
    fn with_catalog(names: &[&str]) -> Self {
        Self {
            catalog: names
                .iter()
                .map(|n| ModelDescriptor { name: n.to_string(), size_bytes: 4 << 30 })
                .collect(),
            ..Default::default()
        }
    }

    fn script(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.warm_gate = Some(gate);
        self
    }

    /// Push a chunk into the most recently opened stream
    async fn push_chunk(&self, text: &str) {
        let tx = self.open_streams.lock().unwrap().last().cloned();
        if let Some(tx) = tx {
            let _ = tx.send(StreamEvent::Chunk(text.to_string())).await;
        }
    }
}

#[async_trait]
impl ModelBackend for FakeBackend {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        match &self.catalog_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.catalog.clone()),
        }
    }

    async fn list_loaded(&self) -> Result<Vec<LoadedModel>> {
        Ok(vec![])
    }

    async fn warm_load(&self, _model: &str) -> Result<()> {
        self.warm_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.warm_gate {
            gate.notified().await;
        }
        match &self.warm_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn stream_chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.sent_context.lock().unwrap().push(messages.to_vec());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Events(vec![StreamEvent::Done]));

        let (tx, rx) = mpsc::channel(64);
        match script {
            Script::Events(events) => {
                for e in events {
                    tx.try_send(e).unwrap();
                }
            }
            Script::Open(chunks) => {
                for c in chunks {
                    tx.try_send(StreamEvent::Chunk(c.to_string())).unwrap();
                }
                self.open_streams.lock().unwrap().push(tx);
            }
            Script::Refuse(e) => return Err(e),
        }
        Ok(rx)
    }
}

// ═══════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════

type Session = SessionController<Transcript>;

fn session(backend: &Arc<FakeBackend>) -> Session {
    let backend: Arc<dyn ModelBackend> = backend.clone();
    SessionController::with_timer(backend, Transcript::new(), LoadingTimer::with_period(Duration::from_millis(20)))
}

/// Feed events until `done` holds
async fn settle(s: &mut Session, done: impl Fn(&Session) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(s) {
            s.process_next_event().await;
        }
    })
    .await
    .expect("session did not settle");
}

fn notices_containing(s: &Session, needle: &str) -> usize {
    s.sink()
        .entries()
        .iter()
        .filter(|e| e.speaker == Speaker::System && e.content.contains(needle))
        .count()
}

fn assistant_entries(s: &Session) -> Vec<String> {
    s.sink()
        .entries()
        .iter()
        .filter(|e| e.speaker == Speaker::Assistant)
        .map(|e| e.content.clone())
        .collect()
}

async fn loaded_session(backend: &Arc<FakeBackend>, model: &str) -> Session {
    let mut s = session(backend);
    s.submit(&format!("/load {}", model));
    settle(&mut s, |s| !s.state().is_loading()).await;
    assert_eq!(s.state().current_model(), Some(model));
    s
}

// ═══════════════════════════════════════════════════════════════
// STORY: User lists models and loads one by number
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_load_model_by_index() {
    let mut t = TestTracer::new("Load a model by its list number");
    let backend = Arc::new(FakeBackend::with_catalog(&["llama3:8b", "mistral:7b", "phi3"]));
    let mut s = session(&backend);

    t.step("User types /models");
    s.submit("/models");
    settle(&mut s, |s| s.registry().catalog().len() == 3).await;
    t.expect(notices_containing(&s, "2. mistral:7b (4.00 GB)") == 1, "Catalog is listed with sizes");

    t.step("User types /load 2");
    s.submit("/load 2");
    t.expect(s.state().is_loading(), "Session is loading");
    t.expect(
        matches!(s.sink().overlay(), Some(Overlay::Loading { model, .. }) if model == "mistral:7b"),
        "Loading overlay names the model",
    );

    settle(&mut s, |s| !s.state().is_loading()).await;
    t.expect(s.state().current_model() == Some("mistral:7b"), "Second model is current");
    t.expect(s.sink().overlay().is_none(), "Overlay dismissed");
    t.expect(notices_containing(&s, "loaded and ready") == 1, "Ready notice shown");
    t.expect(backend.warm_calls.load(Ordering::SeqCst) == 1, "One warm load issued");
    t.expect(s.history().is_empty(), "Commands never enter history");

    t.done();
}

#[tokio::test]
async fn story_load_out_of_range_is_name_lookup() {
    let mut t = TestTracer::new("Out-of-range numbers are treated as names");
    let backend = Arc::new(FakeBackend::with_catalog(&["llama3", "mistral"]));
    let mut s = session(&backend);
    s.submit("/models");
    settle(&mut s, |s| s.registry().catalog().len() == 2).await;

    for arg in ["0", "3", "gemma"] {
        t.step(&format!("User types /load {}", arg));
        s.submit(&format!("/load {}", arg));
        t.expect(!s.state().is_loading(), "Nothing starts loading");
        t.expect(
            notices_containing(&s, &format!("Model not found: {}", arg)) == 1,
            "Model-not-found notice",
        );
    }
    t.expect(s.state().current_model().is_none(), "Current model unchanged");
    t.expect(backend.warm_calls.load(Ordering::SeqCst) == 0, "No network load attempted");

    t.done();
}

#[tokio::test]
async fn story_second_load_while_loading_is_refused() {
    let mut t = TestTracer::new("Second /load while loading asks the user to wait");
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(FakeBackend::with_catalog(&["llama3", "mistral"]).gated(gate.clone()));
    let mut s = session(&backend);
    s.submit("/models");
    settle(&mut s, |s| s.registry().catalog().len() == 2).await;

    t.step("User loads model 1; server is slow");
    s.submit("/load 1");
    t.step("User impatiently loads model 2");
    s.submit("/load 2");
    t.expect(notices_containing(&s, "please wait") == 1, "Exactly one please-wait notice");
    t.expect(s.state().current_model().is_none(), "Current model unchanged while loading");

    t.step("User tries to chat during the load");
    s.submit("hello?");
    t.expect(s.history().is_empty(), "Message refused, history untouched");
    t.expect(notices_containing(&s, "finishes loading") == 1, "Wait notice for chat");

    t.step("Server finishes loading");
    gate.notify_one();
    settle(&mut s, |s| !s.state().is_loading()).await;
    t.expect(s.state().current_model() == Some("llama3"), "First request wins");
    t.expect(backend.warm_calls.load(Ordering::SeqCst) == 1, "Only one warm load issued");

    t.done();
}

#[tokio::test]
async fn story_failed_load_keeps_previous_model() {
    let mut t = TestTracer::new("Failed load reports and keeps the old model");
    let backend = Arc::new(FakeBackend::default());
    let mut s = loaded_session(&backend, "llama3").await;

    let failing = Arc::new(FakeBackend {
        warm_error: Some(ChatError::Transport("API error 404: model not found".into())),
        ..Default::default()
    });
    t.step("Swap in a server that fails loads");
    let mut s2 = session(&failing);
    s2.submit("/load llama3");
    settle(&mut s2, |s| !s.state().is_loading()).await;
    t.expect(s2.state().current_model().is_none(), "No current model after failure");
    t.expect(notices_containing(&s2, "Failed to load model llama3") == 1, "Failure notice");

    t.step("Original session still usable");
    s.submit("/load llama3");
    settle(&mut s, |s| !s.state().is_loading()).await;
    t.expect(s.state().current_model() == Some("llama3"), "Model still current");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User chats and watches the reply stream in
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_streamed_reply_fills_one_entry() {
    let mut t = TestTracer::new("Streamed reply grows one message");
    let backend = Arc::new(FakeBackend::default().script(Script::Events(vec![
        StreamEvent::Chunk("Hel".into()),
        StreamEvent::Chunk("lo".into()),
        StreamEvent::Done,
    ])));
    let mut s = loaded_session(&backend, "llama3").await;

    t.step("User says Hi");
    s.submit("Hi");
    t.expect(s.state().is_generating(), "Session is generating");
    t.expect(s.history().len() == 1, "User turn recorded before the request");

    settle(&mut s, |s| !s.state().is_generating()).await;
    t.expect(
        s.history().messages()
            == [ChatMessage::user("Hi"), ChatMessage::assistant("Hello")].as_slice(),
        "History holds exactly one assistant turn 'Hello'",
    );
    t.expect(assistant_entries(&s) == vec!["Hello".to_string()], "One rendered reply, not one per chunk");
    t.expect(s.sink().entries().iter().all(|e| !e.in_progress), "Reply finalized");

    let sent = backend.sent_context.lock().unwrap().clone();
    t.expect(sent == vec![vec![ChatMessage::user("Hi")]], "Context was the history so far");

    t.done();
}

#[tokio::test]
async fn story_second_turn_sends_full_history() {
    let mut t = TestTracer::new("Follow-up sends the whole conversation");
    let backend = Arc::new(
        FakeBackend::default()
            .script(Script::Events(vec![StreamEvent::Chunk("4".into()), StreamEvent::Done]))
            .script(Script::Events(vec![StreamEvent::Chunk("8".into()), StreamEvent::Done])),
    );
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("2+2?");
    settle(&mut s, |s| !s.state().is_generating()).await;
    t.step("User types a command between turns");
    s.submit("/help");
    s.submit("double it");
    settle(&mut s, |s| !s.state().is_generating()).await;

    let sent = backend.sent_context.lock().unwrap().clone();
    t.expect(sent.len() == 2, "Two requests");
    t.expect(
        sent[1]
            == vec![
                ChatMessage::user("2+2?"),
                ChatMessage::assistant("4"),
                ChatMessage::user("double it"),
            ],
        "Second request carries prior turns and no command text",
    );
    t.expect(s.history().len() == 4, "Four turns in history");

    t.done();
}

#[tokio::test]
async fn story_first_chunk_dismisses_indicator() {
    let mut t = TestTracer::new("Generating indicator clears on first token");
    let backend = Arc::new(FakeBackend::default().script(Script::Open(vec![])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("tell me a story");
    t.expect(s.sink().overlay() == Some(&Overlay::Generating), "Indicator shown while waiting");

    t.step("Let the stream open, then the first token arrives");
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.open_streams.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream never opened");
    backend.push_chunk("Once").await;
    settle(&mut s, |s| assistant_entries(s) == vec!["Once".to_string()]).await;
    t.expect(s.sink().overlay().is_none(), "Indicator dismissed");
    t.expect(s.state().is_generating(), "Still generating");

    s.cancel_generation();
    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User stops a reply
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_cancel_commits_partial_reply() {
    let mut t = TestTracer::new("Stopping keeps the partial reply with a marker");
    let backend = Arc::new(FakeBackend::default().script(Script::Open(vec!["Hel"])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("Hi");
    settle(&mut s, |s| assistant_entries(s) == vec!["Hel".to_string()]).await;

    t.step("User presses Esc");
    t.expect(s.cancel_generation(), "Cancel reports it stopped something");
    t.expect(!s.state().is_generating(), "Not generating immediately after");

    let assistant: Vec<_> = s
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    t.expect(assistant.len() == 1, "Exactly one assistant turn");
    t.expect(assistant[0].content.ends_with(STOP_MARKER), "Turn ends with the stop marker");
    t.expect(assistant[0].content.starts_with("Hel"), "Partial text kept");

    t.step("Late chunks from the server are ignored");
    backend.push_chunk("lo").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    s.drain_events();
    t.expect(s.history().len() == 2, "History unchanged");
    t.expect(assistant_entries(&s)[0].ends_with(STOP_MARKER), "Rendered reply unchanged");

    t.step("Cancelling again is a no-op");
    t.expect(!s.cancel_generation(), "Nothing to cancel");

    t.done();
}

#[tokio::test]
async fn story_cancel_before_any_token() {
    let mut t = TestTracer::new("Stopping before the first token");
    let backend = Arc::new(FakeBackend::default().script(Script::Open(vec![])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("Hi");
    s.cancel_generation();
    t.expect(
        s.history().last() == Some(&ChatMessage::assistant(STOP_MARKER)),
        "Bare marker committed",
    );
    t.expect(s.sink().overlay().is_none(), "Indicator cleared");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Server fails mid-reply
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_stream_error_is_not_committed() {
    let mut t = TestTracer::new("Stream error replaces the reply and stays out of history");
    let backend = Arc::new(FakeBackend::default().script(Script::Events(vec![
        StreamEvent::Chunk("par".into()),
        StreamEvent::Error(ChatError::Transport("connection reset".into())),
    ])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("Hi");
    settle(&mut s, |s| !s.state().is_generating()).await;

    t.expect(s.history().len() == 1, "Only the user turn is stored");
    let rendered = assistant_entries(&s);
    t.expect(rendered.len() == 1, "Still one rendered reply slot");
    t.expect(rendered[0].starts_with("Error:"), "Slot shows the error");
    t.expect(rendered[0].contains("connection reset"), "Error text surfaced");

    t.done();
}

#[tokio::test]
async fn story_stream_refused_to_open() {
    let mut t = TestTracer::new("Server refuses the chat request");
    let backend = Arc::new(
        FakeBackend::default().script(Script::Refuse(ChatError::Transport("API error 500".into()))),
    );
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("Hi");
    settle(&mut s, |s| !s.state().is_generating()).await;
    t.expect(s.history().len() == 1, "No assistant turn");
    t.expect(assistant_entries(&s)[0].contains("API error 500"), "Error shown in place");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User chats before loading a model
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_message_without_model() {
    let mut t = TestTracer::new("Message with no model loaded");
    let backend = Arc::new(FakeBackend::default());
    let mut s = session(&backend);

    s.submit("hello");
    t.expect(s.history().messages() == [ChatMessage::user("hello")].as_slice(), "User turn stored");
    t.expect(notices_containing(&s, "No model loaded") == 1, "No-model notice");
    t.expect(!s.state().is_generating(), "Not generating");
    tokio::time::sleep(Duration::from_millis(20)).await;
    t.expect(backend.stream_calls.load(Ordering::SeqCst) == 0, "Streaming endpoint never called");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User manages the transcript
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_clear_and_reset() {
    let mut t = TestTracer::new("/clear keeps history, /reset drops it");
    let backend = Arc::new(FakeBackend::default().script(Script::Events(vec![
        StreamEvent::Chunk("Hello".into()),
        StreamEvent::Done,
    ])));
    let mut s = loaded_session(&backend, "llama3").await;
    s.submit("Hi");
    settle(&mut s, |s| !s.state().is_generating()).await;

    t.step("User types /clear");
    s.submit("/clear");
    t.expect(s.sink().is_empty(), "Screen empty");
    t.expect(s.history().len() == 2, "History length unchanged");

    t.step("User types /RESET");
    s.submit("/RESET");
    t.expect(s.sink().is_empty(), "Screen empty");
    t.expect(s.history().is_empty(), "History empty");
    t.expect(s.state().current_model() == Some("llama3"), "Model stays loaded");

    t.done();
}

#[tokio::test]
async fn story_history_preview() {
    let mut t = TestTracer::new("/history previews stored turns");
    let long = "x".repeat(120);
    let backend = Arc::new(FakeBackend::default().script(Script::Events(vec![
        StreamEvent::Chunk("short answer".into()),
        StreamEvent::Done,
    ])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("/history");
    t.expect(notices_containing(&s, "History is empty") == 1, "Empty history reported");

    s.submit(&long);
    settle(&mut s, |s| !s.state().is_generating()).await;
    s.submit("/history");

    let preview = s.sink().last().unwrap().content.clone();
    t.expect(preview.contains(&format!("1. [user] {}...", "x".repeat(50))), "User turn cut at 50 chars");
    t.expect(!preview.contains(&"x".repeat(51)), "Nothing beyond 50 chars");
    t.expect(preview.contains("2. [assistant] short answer"), "Assistant turn listed");

    t.done();
}

#[tokio::test]
async fn story_unknown_and_help_commands() {
    let mut t = TestTracer::new("Unknown commands get a fixed notice");
    let backend = Arc::new(FakeBackend::default());
    let mut s = session(&backend);

    s.submit("/dance");
    t.expect(
        notices_containing(&s, "Unknown command: /dance. Type /help for available commands.") == 1,
        "Unknown command notice",
    );
    s.submit("/Help");
    t.expect(notices_containing(&s, "/load <number|name>") == 1, "Help lists /load");
    s.submit("/load");
    t.expect(notices_containing(&s, "Usage: /load") == 1, "Usage for missing argument");
    s.submit("   ");
    t.expect(s.sink().len() == 3, "Blank input ignored");
    t.expect(s.history().is_empty(), "No command reached history");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Server is down
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn story_catalog_failure_degrades_to_empty() {
    let mut t = TestTracer::new("Catalog fetch failure is a notice, not a crash");
    let backend = Arc::new(FakeBackend {
        catalog_error: Some(ChatError::Transport("connection refused".into())),
        ..Default::default()
    });
    let mut s = session(&backend);

    s.submit("/models");
    settle(&mut s, |s| notices_containing(s, "Failed to fetch models") == 1).await;
    t.expect(s.registry().catalog().is_empty(), "Catalog treated as empty");

    t.step("Empty catalog accepts any name");
    s.submit("/load whatever");
    t.expect(s.state().is_loading(), "Load proceeds");
    settle(&mut s, |s| !s.state().is_loading()).await;

    t.done();
}

#[tokio::test]
async fn story_load_refused_while_generating() {
    let mut t = TestTracer::new("Loading is refused during a reply");
    let backend = Arc::new(FakeBackend::default().script(Script::Open(vec!["..."])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("think hard");
    s.submit("/load mistral");
    t.expect(!s.state().is_loading(), "No load started");
    t.expect(s.state().is_generating(), "Reply continues");
    t.expect(backend.warm_calls.load(Ordering::SeqCst) == 1, "Only the initial load happened");

    s.cancel_generation();
    t.done();
}

#[tokio::test]
async fn story_clear_while_reply_streams() {
    let mut t = TestTracer::new("/clear mid-reply keeps the reply on screen");
    let backend = Arc::new(FakeBackend::default().script(Script::Open(vec!["Hel"])));
    let mut s = loaded_session(&backend, "llama3").await;

    s.submit("hi");
    settle(&mut s, |s| assistant_entries(s) == vec!["Hel".to_string()]).await;

    t.step("User types /clear while the reply streams");
    s.submit("/clear");
    t.expect(assistant_entries(&s) == vec!["Hel".to_string()], "Partial reply re-shown alone");
    t.expect(s.state().is_generating(), "Still generating");

    t.step("Rest of the reply arrives");
    backend.push_chunk("lo").await;
    settle(&mut s, |s| assistant_entries(s) == vec!["Hello".to_string()]).await;
    s.cancel_generation();

    let shown = assistant_entries(&s);
    let stored = s.history().last().map(|m| m.content.clone()).unwrap_or_default();
    t.expect(shown.len() == 1, "One reply on screen");
    t.expect(shown[0] == stored, "Screen matches what the model will see");
    t.expect(stored.starts_with("Hello"), "Nothing lost across the clear");

    t.done();
}
