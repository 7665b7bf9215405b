//! Markdown to styled terminal lines
//!
//! GitHub-flavoured subset: headings, emphasis, strike, inline and fenced
//! code, lists, quotes, rules, task markers. Single newlines are kept as
//! line breaks, matching how chat replies are usually written.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};
use ratatui::prelude::*;

struct Renderer {
    lines: Vec<Line<'static>>,
    spans: Vec<Span<'static>>,
    base: Style,
    style: Style,
    list_stack: Vec<Option<u64>>,
    quote_depth: usize,
    in_code_block: bool,
}

impl Renderer {
    fn new(base: Style) -> Self {
        Self {
            lines: Vec::new(),
            spans: Vec::new(),
            base,
            style: base,
            list_stack: Vec::new(),
            quote_depth: 0,
            in_code_block: false,
        }
    }

    fn flush(&mut self) {
        if !self.spans.is_empty() {
            self.lines.push(Line::from(std::mem::take(&mut self.spans)));
        }
    }

    fn push_text(&mut self, text: &str, style: Style) {
        if self.spans.is_empty() && self.quote_depth > 0 {
            let bar = "│ ".repeat(self.quote_depth);
            self.spans.push(Span::styled(bar, Style::default().fg(Color::DarkGray)));
        }
        self.spans.push(Span::styled(text.to_string(), style));
    }

    fn blank(&mut self) {
        if self.lines.last().map_or(false, |l| !l.spans.is_empty()) {
            self.lines.push(Line::raw(""));
        }
    }

    fn start(&mut self, tag: Tag) {
        match tag {
            Tag::Paragraph => self.style = self.base,
            Tag::Heading(level, _, _) => {
                self.flush();
                self.style = self.base.fg(Color::Magenta).add_modifier(Modifier::BOLD);
                let prefix = "#".repeat(level as usize) + " ";
                self.push_text(&prefix, self.style);
            }
            Tag::BlockQuote => {
                self.flush();
                self.quote_depth += 1;
                self.style = self.base.add_modifier(Modifier::ITALIC);
            }
            Tag::CodeBlock(kind) => {
                self.flush();
                self.in_code_block = true;
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.lines.push(Line::styled(format!("```{}", lang), Style::default().fg(Color::DarkGray)));
            }
            Tag::List(start) => {
                self.flush();
                self.list_stack.push(start);
            }
            Tag::Item => {
                self.flush();
                let indent = "  ".repeat(self.list_stack.len().saturating_sub(1));
                let marker = match self.list_stack.last_mut() {
                    Some(Some(n)) => {
                        let m = format!("{}. ", n);
                        *n += 1;
                        m
                    }
                    _ => "• ".to_string(),
                };
                self.style = self.base;
                self.spans.push(Span::raw(indent));
                self.spans.push(Span::styled(marker, Style::default().fg(Color::Green)));
            }
            Tag::Emphasis => self.style = self.style.add_modifier(Modifier::ITALIC),
            Tag::Strong => self.style = self.style.add_modifier(Modifier::BOLD),
            Tag::Strikethrough => self.style = self.style.add_modifier(Modifier::CROSSED_OUT),
            Tag::Link(..) => self.style = self.style.fg(Color::Blue).add_modifier(Modifier::UNDERLINED),
            Tag::Image(..) => self.push_text("[image] ", Style::default().fg(Color::DarkGray)),
            Tag::Table(_) | Tag::TableHead | Tag::TableRow | Tag::TableCell => {}
            Tag::FootnoteDefinition(_) => {}
        }
    }

    fn end(&mut self, tag: Tag) {
        match tag {
            Tag::Paragraph | Tag::Heading(..) => {
                self.flush();
                self.style = self.base;
                if self.list_stack.is_empty() {
                    self.blank();
                }
            }
            Tag::Item => self.flush(),
            Tag::BlockQuote => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
                self.style = self.base;
            }
            Tag::CodeBlock(_) => {
                self.flush();
                self.in_code_block = false;
                self.lines.push(Line::styled("```", Style::default().fg(Color::DarkGray)));
                self.blank();
            }
            Tag::List(_) => {
                self.list_stack.pop();
                if self.list_stack.is_empty() {
                    self.blank();
                }
            }
            Tag::Emphasis => self.style = self.style.remove_modifier(Modifier::ITALIC),
            Tag::Strong => self.style = self.style.remove_modifier(Modifier::BOLD),
            Tag::Strikethrough => self.style = self.style.remove_modifier(Modifier::CROSSED_OUT),
            Tag::Link(..) => {
                self.style = self.style.remove_modifier(Modifier::UNDERLINED);
                self.style.fg = self.base.fg;
            }
            Tag::TableCell => self.push_text(" | ", Style::default().fg(Color::DarkGray)),
            Tag::TableHead | Tag::TableRow => self.flush(),
            Tag::Image(..) | Tag::Table(_) | Tag::FootnoteDefinition(_) => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_code_block {
            let code = Style::default().fg(Color::White).bg(Color::Rgb(40, 40, 40));
            for (i, line) in text.split('\n').enumerate() {
                if i > 0 {
                    self.flush();
                }
                if !line.is_empty() {
                    self.push_text(line, code);
                }
            }
        } else {
            let style = self.style;
            self.push_text(text, style);
        }
    }

    fn finish(mut self) -> Vec<Line<'static>> {
        self.flush();
        while self.lines.last().map_or(false, |l| l.spans.is_empty()) {
            self.lines.pop();
        }
        if self.lines.is_empty() {
            self.lines.push(Line::raw(""));
        }
        self.lines
    }
}

/// Render `input` with `base` as the default text style
pub fn render(input: &str, base: Style) -> Vec<Line<'static>> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut r = Renderer::new(base);
    for event in Parser::new_ext(input, options) {
        match event {
            Event::Start(tag) => r.start(tag),
            Event::End(tag) => r.end(tag),
            Event::Text(text) => r.text(&text),
            Event::Code(code) => {
                r.push_text(&code, Style::default().fg(Color::Yellow).bg(Color::Rgb(50, 50, 50)));
            }
            Event::SoftBreak | Event::HardBreak => r.flush(),
            Event::Rule => {
                r.flush();
                r.lines.push(Line::styled("─".repeat(40), Style::default().fg(Color::DarkGray)));
            }
            Event::TaskListMarker(checked) => {
                r.push_text(if checked { "[x] " } else { "[ ] " }, Style::default().fg(Color::Yellow));
            }
            Event::Html(html) => r.push_text(&html, base),
            Event::FootnoteReference(name) => r.push_text(&format!("[^{}]", name), base),
        }
    }
    r.finish()
}
