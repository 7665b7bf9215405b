//! TUI and interactive components
//!
//! Features:
//! - Fuzzy model picker
//! - Chat loop with streamed Markdown replies
//! - Loading overlay with elapsed time
//! - Models tab (catalog + resident set)

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Tabs, Wrap},
};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use unicode_width::UnicodeWidthStr;

use crate::client::ModelBackend;
use crate::markdown;
use crate::models::{format_size, LoadedModel, ModelDescriptor};
use crate::session::{Phase, SessionController};
use crate::transcript::{Overlay, RenderedEntry, Speaker, Transcript};

// ═══════════════════════════════════════════════════════════════
// MODEL PICKER
// ═══════════════════════════════════════════════════════════════

/// Choose a startup model. Resident models sort first and are marked, since
/// loading one of those is instant.
pub fn pick_model(models: &[ModelDescriptor], loaded: &[LoadedModel]) -> Result<String> {
    let mut terminal = setup_terminal()?;
    let result = run_picker(&mut terminal, models, loaded);
    restore_terminal(terminal)?;
    result
}

fn is_resident(loaded: &[LoadedModel], name: &str) -> bool {
    loaded.iter().any(|l| l.name == name)
}

/// Fuzzy-filter `models` by `query`. Ties and the unfiltered list put
/// resident models first, otherwise catalog order is kept.
fn filter_models<'a>(
    matcher: &SkimMatcherV2,
    models: &'a [ModelDescriptor],
    loaded: &[LoadedModel],
    query: &str,
) -> Vec<&'a ModelDescriptor> {
    let mut scored: Vec<(i64, bool, usize, &ModelDescriptor)> = models
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let score = if query.is_empty() { Some(0) } else { matcher.fuzzy_match(&m.name, query) };
            score.map(|sc| (sc, is_resident(loaded, &m.name), i, m))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
    scored.into_iter().map(|(_, _, _, m)| m).collect()
}

fn picker_label(model: &ModelDescriptor, loaded: &[LoadedModel]) -> Line<'static> {
    let mut spans = vec![
        Span::raw(model.name.clone()),
        Span::styled(format!("  {}", format_size(model.size_bytes)), Style::default().fg(Color::DarkGray)),
    ];
    if is_resident(loaded, &model.name) {
        spans.push(Span::styled("  [loaded]", Style::default().fg(Color::Green)));
    }
    Line::from(spans)
}

fn run_picker(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    models: &[ModelDescriptor],
    loaded: &[LoadedModel],
) -> Result<String> {
    let matcher = SkimMatcherV2::default();
    let mut query = String::new();
    let mut selected = 0usize;

    loop {
        let shown = filter_models(&matcher, models, loaded, &query);
        selected = selected.min(shown.len().saturating_sub(1));

        terminal.draw(|f| {
            let rows = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Min(5), Constraint::Length(1)])
                .split(f.size());

            f.render_widget(
                Paragraph::new(format!("/load {}", query))
                    .block(Block::default().borders(Borders::ALL).title("Load which model?")),
                rows[0],
            );

            let items: Vec<ListItem> = shown.iter().map(|m| ListItem::new(picker_label(m, loaded))).collect();
            let title = format!("{} of {} | {} in memory", shown.len(), models.len(), loaded.len());
            let mut list_state = ListState::default().with_selected(Some(selected));
            f.render_stateful_widget(
                List::new(items)
                    .block(Block::default().borders(Borders::ALL).title(title))
                    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
                    .highlight_symbol("> "),
                rows[1],
                &mut list_state,
            );

            f.render_widget(
                Paragraph::new("Enter: load | Esc: start without a model | type to filter")
                    .style(Style::default().fg(Color::DarkGray)),
                rows[2],
            );
        })?;

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Esc => anyhow::bail!("no model chosen"),
            KeyCode::Enter => {
                if let Some(model) = shown.get(selected) {
                    return Ok(model.name.clone());
                }
            }
            KeyCode::Up => selected = selected.saturating_sub(1),
            KeyCode::Down => selected += 1,
            KeyCode::Char(c) => {
                query.push(c);
                selected = 0;
            }
            KeyCode::Backspace => {
                query.pop();
                selected = 0;
            }
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// MAIN TUI
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tab {
    Chat,
    Models,
}

impl Tab {
    fn all() -> &'static [Tab] {
        &[Tab::Chat, Tab::Models]
    }

    fn name(&self) -> &'static str {
        match self {
            Tab::Chat => "Chat",
            Tab::Models => "Models",
        }
    }
}

struct TuiState {
    tab: Tab,
    input: String,
    /// Rows scrolled up from the bottom of the chat
    scroll_back: u16,
    tick: usize,
}

impl TuiState {
    fn new() -> Self {
        Self { tab: Tab::Chat, input: String::new(), scroll_back: 0, tick: 0 }
    }
}

/// Run the chat TUI until the user quits
pub async fn run_tui(
    backend: Arc<dyn ModelBackend>,
    refresh_every: Duration,
    preload: Option<String>,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = run_tui_loop(&mut terminal, backend, refresh_every, preload).await;
    restore_terminal(terminal)?;
    result
}

async fn run_tui_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    backend: Arc<dyn ModelBackend>,
    refresh_every: Duration,
    preload: Option<String>,
) -> Result<()> {
    let mut state = TuiState::new();
    let mut session =
        SessionController::new(backend, Transcript::new()).with_refresh_interval(refresh_every);

    session.welcome();
    if let Some(model) = preload {
        session.load_model(&model);
    }

    loop {
        state.tick += 1;

        session.drain_events();
        session.refresh_if_due(Instant::now());

        terminal.draw(|f| render_tui(f, &state, &session))?;

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            break;
        }

        match key.code {
            KeyCode::Esc => {
                if !session.cancel_generation() {
                    break;
                }
            }
            KeyCode::Tab => {
                let tabs = Tab::all();
                let idx = tabs.iter().position(|t| *t == state.tab).unwrap_or(0);
                state.tab = tabs[(idx + 1) % tabs.len()];
            }
            KeyCode::PageUp => state.scroll_back = state.scroll_back.saturating_add(10),
            KeyCode::PageDown => state.scroll_back = state.scroll_back.saturating_sub(10),
            KeyCode::Up => state.scroll_back = state.scroll_back.saturating_add(1),
            KeyCode::Down => state.scroll_back = state.scroll_back.saturating_sub(1),
            KeyCode::Enter if state.tab == Tab::Chat => {
                let line = std::mem::take(&mut state.input);
                session.submit(&line);
                state.scroll_back = 0;
            }
            KeyCode::Char(c) if state.tab == Tab::Chat => state.input.push(c),
            KeyCode::Backspace if state.tab == Tab::Chat => {
                state.input.pop();
            }
            _ => {}
        }
    }

    session.cancel_generation();
    Ok(())
}

fn render_tui(f: &mut Frame, state: &TuiState, session: &SessionController<Transcript>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header + tabs
            Constraint::Min(5),    // Main content
            Constraint::Length(3), // Input
            Constraint::Length(1), // Status
        ])
        .split(f.size());

    let model = session.state().current_model().unwrap_or("no model");
    let tabs = Tabs::new(Tab::all().iter().map(|t| t.name()))
        .select(Tab::all().iter().position(|t| *t == state.tab).unwrap_or(0))
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::ALL).title(format!("Tokyo Chat | {}", model)));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        Tab::Chat => render_chat(f, state, session.sink(), chunks[1]),
        Tab::Models => render_models(f, session, chunks[1]),
    }

    let busy = session.state().phase() != Phase::Idle;
    let input_title = match session.state().phase() {
        Phase::Idle => "Message or /command (Enter to send)".to_string(),
        Phase::Loading => "Loading model...".to_string(),
        Phase::Generating => "Generating... (Esc to stop)".to_string(),
    };
    let input = Paragraph::new(state.input.as_str())
        .style(if busy { Style::default().fg(Color::DarkGray) } else { Style::default() })
        .block(Block::default().borders(Borders::ALL).title(input_title));
    f.render_widget(input, chunks[2]);

    let status = format!(
        " {} | {} | {} | Enter:send Esc:stop/quit Tab:models PgUp/PgDn:scroll",
        if busy { spinner_char(state.tick) } else { ' ' },
        model,
        status_text(session),
    );
    f.render_widget(Paragraph::new(status).style(Style::default().fg(Color::DarkGray)), chunks[3]);

    if let Some(Overlay::Loading { model, elapsed }) = session.sink().overlay() {
        render_loading_overlay(f, model, elapsed);
    }
}

fn status_text(session: &SessionController<Transcript>) -> String {
    match (session.state().phase(), session.sink().overlay()) {
        (Phase::Loading, Some(Overlay::Loading { model, elapsed })) => format!("loading {} {}", model, elapsed),
        (Phase::Loading, _) => "loading".into(),
        (Phase::Generating, Some(Overlay::Generating)) => "waiting for first token".into(),
        (Phase::Generating, _) => "streaming".into(),
        (Phase::Idle, _) => format!("{} messages in history", session.history().len()),
    }
}

fn speaker_style(speaker: Speaker) -> Style {
    match speaker {
        Speaker::User => Style::default().fg(Color::Rgb(0, 170, 255)),
        Speaker::Assistant => Style::default().fg(Color::Rgb(85, 255, 85)),
        Speaker::System => Style::default().fg(Color::Rgb(255, 85, 85)),
    }
}

fn entry_lines(entry: &RenderedEntry, tick: usize) -> Vec<Line<'static>> {
    let header = vec![
        Span::styled(format!("{} ", entry.stamp()), Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{} ", entry.speaker.label()), speaker_style(entry.speaker).add_modifier(Modifier::BOLD)),
    ];

    let mut body = if entry.in_progress && entry.content.is_empty() {
        vec![Line::styled(spinner_char(tick).to_string(), Style::default().fg(Color::DarkGray))]
    } else {
        markdown::render(&entry.content, Style::default())
    };

    // Header shares the first line with the content
    let mut lines = Vec::with_capacity(body.len() + 1);
    let mut first = body.remove(0);
    let mut spans = header;
    spans.append(&mut first.spans);
    lines.push(Line::from(spans));
    lines.append(&mut body);
    lines.push(Line::raw(""));
    lines
}

/// Rows a line occupies once wrapped to `width`
fn wrapped_rows(line: &Line, width: u16) -> u16 {
    let w: usize = line.spans.iter().map(|s| s.content.width()).sum();
    let width = width.max(1) as usize;
    (w.max(1) + width - 1).div_euclid(width) as u16
}

fn render_chat(f: &mut Frame, state: &TuiState, transcript: &Transcript, area: Rect) {
    let lines: Vec<Line> = transcript
        .entries()
        .iter()
        .flat_map(|e| entry_lines(e, state.tick))
        .collect();

    let inner_width = area.width.saturating_sub(2);
    let inner_height = area.height.saturating_sub(2);
    let total: u16 = lines.iter().map(|l| wrapped_rows(l, inner_width)).fold(0u16, |a, b| a.saturating_add(b));
    let bottom = total.saturating_sub(inner_height);
    let offset = bottom.saturating_sub(state.scroll_back);

    let title = if state.scroll_back > 0 { "Chat (scrolled)" } else { "Chat" };
    let para = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((offset, 0))
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(para, area);
}

fn render_models(f: &mut Frame, session: &SessionController<Transcript>, area: Rect) {
    let registry = session.registry();
    let mut lines = vec!["── Catalog ──".to_string()];
    if registry.catalog().is_empty() {
        lines.push("(none; is Ollama running?)".into());
    } else {
        lines.extend(registry.catalog_lines(session.state().current_model()));
    }
    lines.push(String::new());
    lines.push("── In memory ──".into());
    if registry.loaded().is_empty() {
        lines.push("(none)".into());
    } else {
        lines.extend(registry.loaded().iter().map(|m| format!("• {}", m.name)));
    }

    let para = Paragraph::new(lines.join("\n"))
        .block(Block::default().borders(Borders::ALL).title("Models (/load <number|name>)"));
    f.render_widget(para, area);
}

fn render_loading_overlay(f: &mut Frame, model: &str, elapsed: &str) {
    let text = format!("Loading {}\n\n{}", model, elapsed);
    let width = (model.width() as u16 + 14).clamp(24, f.size().width);
    let area = centered_rect(width, 5, f.size());
    f.render_widget(Clear, area);
    let para = Paragraph::new(text)
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title("Please wait"));
    f.render_widget(para, area);
}

fn centered_rect(width: u16, height: u16, outer: Rect) -> Rect {
    let width = width.min(outer.width);
    let height = height.min(outer.height);
    Rect {
        x: outer.x + (outer.width - width) / 2,
        y: outer.y + (outer.height - height) / 2,
        width,
        height,
    }
}

fn spinner_char(tick: usize) -> char {
    const SPINNER: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
    SPINNER[tick % SPINNER.len()]
}

// ═══════════════════════════════════════════════════════════════
// TERMINAL SETUP
// ═══════════════════════════════════════════════════════════════

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
