//! Generation session controller
//!
//! Owns the session state machine:
//!
//! ```text
//! Idle ──/load──> Loading ──warm load done/failed──> Idle
//! Idle ──message─> Generating ──end / error / cancel──> Idle
//! ```
//!
//! Loading and Generating exclude each other. Network work runs in spawned
//! tasks that report back as `SessionEvent`s; all state is mutated by the
//! single loop that feeds those events into `handle_event`, so nothing here
//! needs a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ModelBackend, StreamEvent};
use crate::commands::{self, Command};
use crate::error::{ChatError, Result};
use crate::models::{LoadedModel, ModelDescriptor, ModelRegistry};
use crate::timer::{format_elapsed, LoadingTimer};
use crate::transcript::{ChatMessage, EntryId, History, Overlay, Speaker, TranscriptSink};

/// Silent registry refresh period
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Appended to a reply the user stopped
pub const STOP_MARKER: &str = "[Generation stopped by user]";

const STILL_GENERATING: &str = "A reply is still being generated. Wait for it or press Esc to stop it.";

pub const WELCOME: &str = "\
Welcome to Tokyo Chat!

- Type your message and press Enter to send
- Markdown formatting is supported
- Try using **bold**, *italic*, or `code`
- Type `/help` to see available commands";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Generating,
}

/// What the rest of the app may observe about the session
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    current_model: Option<String>,
    phase: Phase,
}

impl SessionState {
    pub fn current_model(&self) -> Option<&str> {
        self.current_model.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn is_generating(&self) -> bool {
        self.phase == Phase::Generating
    }
}

/// Completion reports from background tasks
#[derive(Debug)]
pub enum SessionEvent {
    CatalogFetched { seq: u64, result: Result<Vec<ModelDescriptor>>, announce: bool },
    LoadedFetched { seq: u64, result: Result<Vec<LoadedModel>>, announce: bool },
    LoadTick(Duration),
    LoadFinished { model: String, result: Result<()> },
    Chunk { generation: u64, text: String },
    StreamEnded { generation: u64 },
    StreamFailed { generation: u64, error: ChatError },
}

/// Registry fetch bookkeeping. Results older than the last applied one
/// are dropped so the lists always come from the latest fetch.
#[derive(Debug, Default)]
struct RefreshState {
    catalog_issued: u64,
    catalog_applied: u64,
    loaded_issued: u64,
    loaded_applied: u64,
    in_flight: usize,
    last: Option<Instant>,
}

/// The one live generation
struct ActiveGeneration {
    id: u64,
    token: CancellationToken,
    entry: EntryId,
    buffer: String,
    first_chunk_seen: bool,
}

pub struct SessionController<S: TranscriptSink> {
    backend: Arc<dyn ModelBackend>,
    sink: S,
    registry: ModelRegistry,
    history: History,
    state: SessionState,
    active: Option<ActiveGeneration>,
    loading_model: Option<String>,
    timer: LoadingTimer,
    refresh: RefreshState,
    refresh_every: Duration,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<S: TranscriptSink> SessionController<S> {
    pub fn new(backend: Arc<dyn ModelBackend>, sink: S) -> Self {
        Self::with_timer(backend, sink, LoadingTimer::new())
    }

    pub fn with_timer(backend: Arc<dyn ModelBackend>, sink: S, timer: LoadingTimer) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            sink,
            registry: ModelRegistry::new(),
            history: History::new(),
            state: SessionState::default(),
            active: None,
            loading_model: None,
            timer,
            refresh: RefreshState::default(),
            refresh_every: REFRESH_INTERVAL,
            next_generation: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn with_refresh_interval(mut self, every: Duration) -> Self {
        self.refresh_every = every;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn welcome(&mut self) {
        self.sink.notice(WELCOME);
    }

    // ═══════════════════════════════════════════════════════════════
    // Input
    // ═══════════════════════════════════════════════════════════════

    /// Entry point for a line typed by the user
    pub fn submit(&mut self, input: &str) {
        let input = input.trim();
        if input.is_empty() {
            return;
        }
        match commands::parse(input) {
            Some(cmd) => self.run_command(cmd),
            None => self.send_message(input),
        }
    }

    pub fn run_command(&mut self, cmd: Command) {
        debug!(?cmd, "command");
        match cmd {
            Command::Models => self.refresh_models(true),
            Command::Loaded => self.refresh_loaded(true),
            Command::Load(Some(identifier)) => self.load_model(&identifier),
            Command::Load(None) => {
                self.sink.notice("Usage: /load <number|name>. Use /models to see available models.")
            }
            Command::Clear => self.clear_screen(),
            Command::Reset => self.reset(),
            Command::History => self.show_history(),
            Command::Help => self.sink.notice(commands::HELP_TEXT),
            Command::Unknown(name) => self.sink.notice(&commands::unknown_notice(&name)),
        }
    }

    fn clear_screen(&mut self) {
        self.sink.clear();
        // A live reply gets a fresh slot so the rest of it stays visible
        if let Some(active) = self.active.as_mut() {
            active.entry = self.sink.append_entry(Speaker::Assistant, &active.buffer);
        }
    }

    fn reset(&mut self) {
        // Drop the live reply without committing it: the history it would land in is gone
        if let Some(active) = self.active.take() {
            active.token.cancel();
            self.state.phase = Phase::Idle;
            self.sink.set_overlay(None);
        }
        self.sink.clear();
        self.history.clear();
        info!("conversation reset");
    }

    fn show_history(&mut self) {
        if self.history.is_empty() {
            self.sink.notice("History is empty.");
            return;
        }
        let text = format!(
            "Conversation history ({} messages):\n{}",
            self.history.len(),
            self.history.previews().join("\n")
        );
        self.sink.notice(&text);
    }

    // ═══════════════════════════════════════════════════════════════
    // Registry
    // ═══════════════════════════════════════════════════════════════

    /// Fetch the catalog; `announce` lists the result in the transcript
    pub fn refresh_models(&mut self, announce: bool) {
        self.refresh.catalog_issued += 1;
        self.refresh.in_flight += 1;
        let seq = self.refresh.catalog_issued;
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_models().await;
            let _ = tx.send(SessionEvent::CatalogFetched { seq, result, announce });
        });
    }

    pub fn refresh_loaded(&mut self, announce: bool) {
        self.refresh.loaded_issued += 1;
        self.refresh.in_flight += 1;
        let seq = self.refresh.loaded_issued;
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_loaded().await;
            let _ = tx.send(SessionEvent::LoadedFetched { seq, result, announce });
        });
    }

    /// Silent refresh of both lists
    pub fn refresh_registry(&mut self) {
        self.refresh_registry_at(Instant::now());
    }

    fn refresh_registry_at(&mut self, now: Instant) {
        self.refresh.last = Some(now);
        self.refresh_models(false);
        self.refresh_loaded(false);
    }

    /// A silent refresh is due once the interval has passed and no earlier
    /// fetch is still outstanding
    pub fn refresh_due(&self, now: Instant) -> bool {
        if self.refresh.in_flight > 0 {
            return false;
        }
        match self.refresh.last {
            Some(last) => now.saturating_duration_since(last) >= self.refresh_every,
            None => true,
        }
    }

    /// Run the periodic refresh if due. Returns whether one started.
    pub fn refresh_if_due(&mut self, now: Instant) -> bool {
        if !self.refresh_due(now) {
            return false;
        }
        self.refresh_registry_at(now);
        true
    }

    fn fetch_returned(&mut self) {
        self.refresh.in_flight = self.refresh.in_flight.saturating_sub(1);
    }

    fn on_catalog(&mut self, seq: u64, result: Result<Vec<ModelDescriptor>>, announce: bool) {
        self.fetch_returned();
        if seq <= self.refresh.catalog_applied {
            debug!(seq, applied = self.refresh.catalog_applied, "stale catalog dropped");
            if announce {
                self.announce_catalog();
            }
            return;
        }
        self.refresh.catalog_applied = seq;

        match result {
            Ok(models) => {
                debug!(count = models.len(), "catalog refreshed");
                self.registry.replace_catalog(models);
                if announce {
                    self.announce_catalog();
                }
            }
            Err(e) => {
                warn!(error = %e, "catalog refresh failed");
                self.registry.replace_catalog(Vec::new());
                if announce {
                    self.sink.notice(&format!("Failed to fetch models: {}", e));
                }
            }
        }
    }

    fn announce_catalog(&mut self) {
        if self.registry.catalog().is_empty() {
            self.sink.notice("No models found. Is Ollama running, and have you pulled a model?");
            return;
        }
        let lines = self.registry.catalog_lines(self.state.current_model());
        let text = format!(
            "Available models:\n{}\n\nUse `/load <number|name>` to load a model.",
            lines.join("\n")
        );
        self.sink.notice(&text);
    }

    fn on_loaded(&mut self, seq: u64, result: Result<Vec<LoadedModel>>, announce: bool) {
        self.fetch_returned();
        if seq <= self.refresh.loaded_applied {
            debug!(seq, applied = self.refresh.loaded_applied, "stale loaded set dropped");
            if announce {
                self.announce_loaded();
            }
            return;
        }
        self.refresh.loaded_applied = seq;

        match result {
            Ok(models) => {
                self.registry.replace_loaded(models);
                if announce {
                    self.announce_loaded();
                }
            }
            Err(e) => {
                warn!(error = %e, "loaded-model refresh failed");
                self.registry.replace_loaded(Vec::new());
                if announce {
                    self.sink.notice(&format!("Failed to fetch loaded models: {}", e));
                }
            }
        }
    }

    fn announce_loaded(&mut self) {
        if self.registry.loaded().is_empty() {
            self.sink.notice("No models currently loaded.");
            return;
        }
        let names: Vec<String> = self
            .registry
            .loaded()
            .iter()
            .map(|m| format!("- {}", m.name))
            .collect();
        self.sink.notice(&format!("Loaded models:\n{}", names.join("\n")));
    }

    // ═══════════════════════════════════════════════════════════════
    // Loading
    // ═══════════════════════════════════════════════════════════════

    /// Resolve and warm-load a model. Refused while anything else runs.
    pub fn load_model(&mut self, identifier: &str) {
        match self.state.phase {
            Phase::Loading => {
                let model = self.loading_model.clone().unwrap_or_default();
                self.refuse(ChatError::Busy(format!("Already loading {}, please wait...", model)));
                return;
            }
            Phase::Generating => {
                self.refuse(ChatError::Busy(STILL_GENERATING.into()));
                return;
            }
            Phase::Idle => {}
        }

        let model = match self.registry.resolve(identifier) {
            Ok(name) => name,
            Err(e) => {
                debug!(identifier, error = %e, "load rejected");
                self.sink.notice(&format!(
                    "Model not found: {}. Use /models to see available models.",
                    identifier.trim()
                ));
                return;
            }
        };

        info!(model = %model, "loading model");
        self.state.phase = Phase::Loading;
        self.loading_model = Some(model.clone());
        self.sink.notice(&format!("Loading model {}...", model));
        self.sink.set_overlay(Some(Overlay::Loading {
            model: model.clone(),
            elapsed: format_elapsed(Duration::ZERO),
        }));

        let tick_tx = self.events_tx.clone();
        self.timer
            .start(move |elapsed| tick_tx.send(SessionEvent::LoadTick(elapsed)).is_ok());

        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = backend.warm_load(&model).await;
            let _ = tx.send(SessionEvent::LoadFinished { model, result });
        });
    }

    fn refuse(&mut self, reason: ChatError) {
        debug!(phase = ?self.state.phase, %reason, "refused");
        self.sink.notice(&reason.to_string());
    }

    fn on_load_tick(&mut self, elapsed: Duration) {
        if let (Phase::Loading, Some(model)) = (self.state.phase, &self.loading_model) {
            self.sink.set_overlay(Some(Overlay::Loading {
                model: model.clone(),
                elapsed: format_elapsed(elapsed),
            }));
        }
    }

    fn on_load_finished(&mut self, model: String, result: Result<()>) {
        if self.state.phase != Phase::Loading {
            return;
        }
        let elapsed = self.timer.elapsed().map(format_elapsed).unwrap_or_default();
        self.timer.stop();
        self.sink.set_overlay(None);
        self.state.phase = Phase::Idle;
        self.loading_model = None;

        match result {
            Ok(()) => {
                info!(model = %model, elapsed = %elapsed, "model loaded");
                self.sink.notice(&format!("Model {} loaded and ready ({}).", model, elapsed));
                self.state.current_model = Some(model);
                self.refresh_loaded(false);
            }
            Err(e) => {
                warn!(model = %model, error = %e, "model load failed");
                self.sink.notice(&format!("Failed to load model {}: {}", model, e));
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Generating
    // ═══════════════════════════════════════════════════════════════

    /// Record a user turn and stream the reply
    pub fn send_message(&mut self, text: &str) {
        match self.state.phase {
            Phase::Loading => {
                let model = self.loading_model.clone().unwrap_or_default();
                self.refuse(ChatError::Busy(format!("Please wait until {} finishes loading.", model)));
                return;
            }
            Phase::Generating => {
                self.refuse(ChatError::Busy(STILL_GENERATING.into()));
                return;
            }
            Phase::Idle => {}
        }

        self.history.push(ChatMessage::user(text));
        let id = self.sink.append_entry(Speaker::User, text);
        self.sink.finalize(id);

        let Some(model) = self.state.current_model.clone() else {
            self.sink
                .notice("No model loaded. Use /models to list models and /load <number|name> to load one.");
            return;
        };

        self.start_generation(model);
    }

    fn start_generation(&mut self, model: String) {
        if let Some(previous) = self.active.take() {
            previous.token.cancel();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();
        let entry = self.sink.append_entry(Speaker::Assistant, "");
        self.sink.set_overlay(Some(Overlay::Generating));
        self.state.phase = Phase::Generating;
        self.active = Some(ActiveGeneration {
            id: generation,
            token: token.clone(),
            entry,
            buffer: String::new(),
            first_chunk_seen: false,
        });

        info!(model = %model, generation, turns = self.history.len(), "generation started");

        let messages = self.history.messages().to_vec();
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            forward_stream(backend, model, messages, token, generation, tx).await;
        });
    }

    /// Stop the live reply, keeping what arrived so far. Returns false when
    /// nothing was generating.
    pub fn cancel_generation(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.token.cancel();

        let content = if active.buffer.is_empty() {
            STOP_MARKER.to_string()
        } else {
            format!("{}\n\n{}", active.buffer, STOP_MARKER)
        };
        self.sink.update_in_progress(active.entry, &content);
        self.sink.finalize(active.entry);
        self.sink.set_overlay(None);
        self.history.push(ChatMessage::assistant(content));
        self.state.phase = Phase::Idle;

        info!(generation = active.id, received = active.buffer.len(), "generation stopped by user");
        true
    }

    fn live(&mut self, generation: u64) -> Option<&mut ActiveGeneration> {
        self.active
            .as_mut()
            .filter(|a| a.id == generation && !a.token.is_cancelled())
    }

    fn on_chunk(&mut self, generation: u64, text: String) {
        let Some(active) = self.live(generation) else {
            return;
        };
        active.buffer.push_str(&text);
        let first = !active.first_chunk_seen && !text.is_empty();
        if first {
            active.first_chunk_seen = true;
        }
        let entry = active.entry;
        let content = active.buffer.clone();

        if first {
            self.sink.set_overlay(None);
        }
        self.sink.update_in_progress(entry, &content);
    }

    fn on_stream_ended(&mut self, generation: u64) {
        if self.live(generation).is_none() {
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        self.sink.update_in_progress(active.entry, &active.buffer);
        self.sink.finalize(active.entry);
        self.sink.set_overlay(None);
        self.state.phase = Phase::Idle;

        info!(generation, chars = active.buffer.chars().count(), "generation complete");
        self.history.push(ChatMessage::assistant(active.buffer));
    }

    fn on_stream_failed(&mut self, generation: u64, error: ChatError) {
        if self.live(generation).is_none() {
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        warn!(generation, error = %error, "generation failed");
        // Error text replaces the partial reply and stays out of the history
        self.sink.update_in_progress(active.entry, &format!("Error: {}", error));
        self.sink.finalize(active.entry);
        self.sink.set_overlay(None);
        self.state.phase = Phase::Idle;
    }

    // ═══════════════════════════════════════════════════════════════
    // Event loop plumbing
    // ═══════════════════════════════════════════════════════════════

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CatalogFetched { seq, result, announce } => self.on_catalog(seq, result, announce),
            SessionEvent::LoadedFetched { seq, result, announce } => self.on_loaded(seq, result, announce),
            SessionEvent::LoadTick(elapsed) => self.on_load_tick(elapsed),
            SessionEvent::LoadFinished { model, result } => self.on_load_finished(model, result),
            SessionEvent::Chunk { generation, text } => self.on_chunk(generation, text),
            SessionEvent::StreamEnded { generation } => self.on_stream_ended(generation),
            SessionEvent::StreamFailed { generation, error } => self.on_stream_failed(generation, error),
        }
    }

    /// Apply every event already queued. Never blocks.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next event and apply it
    pub async fn process_next_event(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.handle_event(event);
        }
    }
}

/// Pump one backend stream into session events. Polls the token before
/// opening the stream and on every chunk.
async fn forward_stream(
    backend: Arc<dyn ModelBackend>,
    model: String,
    messages: Vec<ChatMessage>,
    token: CancellationToken,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    if token.is_cancelled() {
        return;
    }

    let mut rx = match backend.stream_chat(&model, &messages, token.clone()).await {
        Ok(rx) => rx,
        Err(ChatError::Aborted) => return,
        Err(error) => {
            let _ = tx.send(SessionEvent::StreamFailed { generation, error });
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            e = rx.recv() => e,
        };
        let sent = match event {
            Some(StreamEvent::Chunk(text)) => tx.send(SessionEvent::Chunk { generation, text }),
            Some(StreamEvent::Done) | None => {
                let _ = tx.send(SessionEvent::StreamEnded { generation });
                return;
            }
            Some(StreamEvent::Error(error)) => {
                let _ = tx.send(SessionEvent::StreamFailed { generation, error });
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
}
