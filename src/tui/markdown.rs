use crossterm::style::ContentStyle;
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use super::console::{merge_styles, Line, Span, Theme};

/// Render markdown into styled terminal lines. Trailing blank lines are
/// dropped.
pub fn render(source: &str, theme: &Theme) -> Vec<Line> {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut renderer = Renderer::new(theme);
    for event in Parser::new_ext(source, options) {
        renderer.event(event);
    }
    renderer.finish()
}

/// Terminal rows needed to show `lines` at `width` columns.
pub fn rows_for(lines: &[Line], width: u16) -> usize {
    let width = usize::from(width.max(1));
    lines
        .iter()
        .map(|line| {
            let chars: usize = line.iter().map(|s| s.text.chars().count()).sum();
            chars.div_ceil(width).max(1)
        })
        .sum()
}

struct Renderer<'t> {
    theme: &'t Theme,
    lines: Vec<Line>,
    current: Line,
    prefix_len: usize,
    styles: Vec<ContentStyle>,
    lists: Vec<Option<u64>>,
    pending_marker: Option<String>,
    quote_depth: usize,
    in_code_block: bool,
    link_dest: Option<String>,
}

impl<'t> Renderer<'t> {
    fn new(theme: &'t Theme) -> Self {
        Self {
            theme,
            lines: Vec::new(),
            current: Vec::new(),
            prefix_len: 0,
            styles: Vec::new(),
            lists: Vec::new(),
            pending_marker: None,
            quote_depth: 0,
            in_code_block: false,
            link_dest: None,
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => {
                if self.in_code_block {
                    self.code_block_text(&text);
                } else {
                    self.push_text(&text, self.current_style());
                }
            }
            Event::Code(code) => {
                let style = merge_styles(self.current_style(), self.theme.style("code"));
                self.push_text(&code, style);
            }
            Event::Html(html) => self.push_text(html.trim_end(), self.current_style()),
            Event::SoftBreak => self.push_text(" ", self.current_style()),
            Event::HardBreak => self.flush_line(),
            Event::Rule => {
                self.flush_line();
                self.lines
                    .push(vec![Span::styled("─".repeat(40), self.theme.style("border"))]);
                self.blank_line();
            }
            Event::TaskListMarker(done) => {
                let marker = if done { "[x] " } else { "[ ] " };
                self.push_text(marker, self.theme.style("markdown.bullet"));
            }
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Heading { level, .. } => {
                self.flush_line();
                let name = if level == HeadingLevel::H1 {
                    "markdown.h1"
                } else {
                    "markdown.h"
                };
                self.styles.push(self.theme.style(name));
            }
            Tag::BlockQuote => {
                self.flush_line();
                self.quote_depth += 1;
                self.styles.push(self.theme.style("markdown.quote"));
            }
            Tag::CodeBlock(_) => {
                self.flush_line();
                self.in_code_block = true;
            }
            Tag::List(start) => {
                self.flush_line();
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush_line();
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                self.pending_marker = Some(marker);
            }
            Tag::Emphasis => self.styles.push(self.theme.style("markdown.em")),
            Tag::Strong => self.styles.push(self.theme.style("markdown.strong")),
            Tag::Strikethrough => self.styles.push(self.theme.style("markdown.strike")),
            Tag::Link { dest_url, .. } => {
                self.styles.push(self.theme.style("markdown.link"));
                self.link_dest = Some(dest_url.to_string());
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => {
                self.flush_line();
                if self.lists.is_empty() {
                    self.blank_line();
                }
            }
            TagEnd::Heading(_) => {
                self.styles.pop();
                self.flush_line();
                self.blank_line();
            }
            TagEnd::BlockQuote => {
                self.styles.pop();
                self.flush_line();
                self.quote_depth = self.quote_depth.saturating_sub(1);
                self.blank_line();
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                self.flush_line();
                self.blank_line();
            }
            TagEnd::List(_) => {
                self.flush_line();
                self.lists.pop();
                if self.lists.is_empty() {
                    self.blank_line();
                }
            }
            TagEnd::Item => self.flush_line(),
            TagEnd::Emphasis | TagEnd::Strong | TagEnd::Strikethrough => {
                self.styles.pop();
            }
            TagEnd::Link => {
                self.styles.pop();
                if let Some(dest) = self.link_dest.take() {
                    let shown: String = self.current.iter().map(|s| s.text.as_str()).collect();
                    if !dest.is_empty() && !shown.ends_with(&dest) {
                        self.push_text(&format!(" ({dest})"), self.theme.style("dim"));
                    }
                }
            }
            _ => {}
        }
    }

    fn current_style(&self) -> ContentStyle {
        self.styles
            .iter()
            .fold(ContentStyle::new(), |acc, s| merge_styles(acc, *s))
    }

    fn code_block_text(&mut self, text: &str) {
        let style = self.theme.style("code");
        let mut pieces = text.split('\n').peekable();
        while let Some(piece) = pieces.next() {
            let last = pieces.peek().is_none();
            if last && piece.is_empty() {
                break;
            }
            self.push_text(&format!("  {piece}"), style);
            if !last {
                self.flush_line();
            }
        }
    }

    /// Quote bars, list indentation and any pending item marker for a fresh
    /// line.
    fn line_prefix(&mut self) -> Line {
        let mut prefix = Vec::new();
        if self.quote_depth > 0 {
            prefix.push(Span::styled(
                "│ ".repeat(self.quote_depth),
                self.theme.style("dim"),
            ));
        }
        if !self.lists.is_empty() {
            let indent = "  ".repeat(self.lists.len() - 1);
            match self.pending_marker.take() {
                Some(marker) => {
                    if !indent.is_empty() {
                        prefix.push(Span::plain(indent));
                    }
                    prefix.push(Span::styled(marker, self.theme.style("markdown.bullet")));
                }
                None => prefix.push(Span::plain(format!("{indent}  "))),
            }
        }
        prefix
    }

    fn push_text(&mut self, text: &str, style: ContentStyle) {
        if text.is_empty() {
            return;
        }
        if self.current.is_empty() {
            self.current = self.line_prefix();
            self.prefix_len = self.current.len();
        }
        let body = self.current.len() > self.prefix_len;
        match self.current.last_mut() {
            Some(last) if body && last.style == style => last.text.push_str(text),
            _ => self.current.push(Span::styled(text, style)),
        }
    }

    fn flush_line(&mut self) {
        if !self.current.is_empty() {
            let line = std::mem::take(&mut self.current);
            self.lines.push(line);
        }
        self.prefix_len = 0;
    }

    fn blank_line(&mut self) {
        if self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(Vec::new());
        }
    }

    fn finish(mut self) -> Vec<Line> {
        self.flush_line();
        while self.lines.last().is_some_and(|l| l.is_empty()) {
            self.lines.pop();
        }
        self.lines
    }
}
