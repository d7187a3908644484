//! Terminal presentation for agent events.

pub mod console;
pub mod markdown;

use std::io;
use std::time::{Duration, Instant};

use crate::types::TokenUsage;

pub use console::{Console, Line, SharedBuffer, Span, Theme};

/// Minimum gap between live redraws of the streaming response.
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

const HELP_TEXT: &str = "\
## Commands

- `/help` - Show this help
- `/model <name>` - Change the model
- `exit` - Exit the shell

## Tips

- Just type your message to chat with the agent
- Responses stream in as they are generated and are rendered as markdown
- End input (Ctrl-D) also exits
";

/// Renders agent activity onto a [`Console`].
///
/// In markdown mode assistant text is buffered and rendered when the turn
/// settles. On a live terminal the buffer is also redrawn in place while it
/// streams, as long as it fits on screen.
pub struct Tui {
    console: Console,
    use_markdown: bool,
    stream_open: bool,
    buffer: String,
    /// Rows occupied by the status line or live preview, erased on redraw.
    live_rows: u16,
    last_draw: Option<Instant>,
    /// Raw deltas were written without a trailing newline.
    raw_pending: bool,
}

impl Tui {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            use_markdown: true,
            stream_open: false,
            buffer: String::new(),
            live_rows: 0,
            last_draw: None,
            raw_pending: false,
        }
    }

    /// Stream raw deltas instead of buffered markdown when `false`.
    pub fn with_markdown(mut self, enabled: bool) -> Self {
        self.use_markdown = enabled;
        self
    }

    pub fn begin_assistant(&mut self) -> io::Result<()> {
        self.settle()?;
        self.console.newline()?;
        self.rule("Assistant", "assistant")?;
        self.stream_open = true;
        self.buffer.clear();
        self.last_draw = None;
        self.console.flush()
    }

    /// Transient status line, replaced by the first streamed text. Only shown
    /// on a live terminal.
    pub fn assistant_thinking(&mut self, label: &str) -> io::Result<()> {
        if !self.console.is_live() {
            return Ok(());
        }
        self.clear_live()?;
        self.console.print("thinking", &format!("… {label}"))?;
        self.console.newline()?;
        self.live_rows = 1;
        self.console.flush()
    }

    pub fn stream_assistant_delta(&mut self, content: &str) -> io::Result<()> {
        if !self.use_markdown {
            self.clear_live()?;
            self.console.print("", content)?;
            self.raw_pending = !content.ends_with('\n');
            return self.console.flush();
        }
        self.buffer.push_str(content);
        if !self.console.is_live() {
            return Ok(());
        }
        let due = self
            .last_draw
            .map_or(true, |at| at.elapsed() >= REDRAW_INTERVAL);
        if due {
            self.redraw()?;
        }
        Ok(())
    }

    /// Full text arrives after the deltas already shown it.
    pub fn text_complete(&mut self, _content: &str) {}

    pub fn end_assistant(&mut self) -> io::Result<()> {
        if self.stream_open {
            self.settle()?;
            self.console.newline()?;
        }
        self.stream_open = false;
        self.buffer.clear();
        self.console.flush()
    }

    pub fn agent_started(&mut self, agent_name: &str, _message: &str) -> io::Result<()> {
        self.settle()?;
        self.console.print("working", "▶ Agent started:")?;
        self.console.print("", " ")?;
        self.console.print("dim", agent_name)?;
        self.console.newline()?;
        self.console.flush()
    }

    pub fn agent_finished(&mut self, _agent_name: &str, response: Option<&str>) -> io::Result<()> {
        if response.map_or(true, str::is_empty) {
            return Ok(());
        }
        self.settle()?;
        self.console.newline()?;
        self.console.print("done", "✓ Agent finished")?;
        self.console.newline()?;
        self.console.flush()
    }

    pub fn agent_error(&mut self, message: &str) -> io::Result<()> {
        self.settle()?;
        self.console.print("error", "✗ Error:")?;
        self.console.print("", &format!(" {message}"))?;
        self.console.newline()?;
        self.console.flush()
    }

    pub fn info(&mut self, message: &str) -> io::Result<()> {
        self.notice("info", &format!("ℹ {message}"))
    }

    pub fn success(&mut self, message: &str) -> io::Result<()> {
        self.notice("success", &format!("✓ {message}"))
    }

    pub fn warning(&mut self, message: &str) -> io::Result<()> {
        self.notice("warning", &format!("⚠ {message}"))
    }

    pub fn goodbye(&mut self) -> io::Result<()> {
        self.notice("error", "Exiting... Goodbye!")
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.console.print("info", "You:")?;
        self.console.print("", " ")?;
        self.console.flush()
    }

    pub fn show_welcome_message(&mut self, agent_name: &str, model: &str) -> io::Result<()> {
        self.rule("Agent shell", "highlight")?;
        self.stat("agent", agent_name)?;
        self.stat("model", model)?;
        self.console.newline()?;
        self.console.print("dim", "Type a message to chat, /help for commands, exit to quit.")?;
        self.console.newline()?;
        self.console.flush()
    }

    pub fn show_help(&mut self) -> io::Result<()> {
        self.settle()?;
        self.print_markdown(HELP_TEXT)?;
        self.console.flush()
    }

    /// Token totals for the session. Prints nothing when no usage was
    /// reported.
    pub fn usage_summary(&mut self, usage: &TokenUsage) -> io::Result<()> {
        if usage.is_zero() {
            return Ok(());
        }
        self.rule("Session usage", "dim")?;
        self.stat("prompt tokens", &usage.prompt_tokens.to_string())?;
        self.stat("completion tokens", &usage.completion_tokens.to_string())?;
        self.stat("total tokens", &usage.total_tokens.to_string())?;
        self.stat("cached tokens", &usage.cached_tokens.to_string())?;
        self.console.flush()
    }

    fn notice(&mut self, style: &str, text: &str) -> io::Result<()> {
        self.settle()?;
        self.console.print(style, text)?;
        self.console.newline()?;
        self.console.flush()
    }

    fn stat(&mut self, label: &str, value: &str) -> io::Result<()> {
        self.console.print("stat.label", &format!("  {label}: "))?;
        self.console.print("stat.value", value)?;
        self.console.newline()
    }

    fn rule(&mut self, title: &str, style: &str) -> io::Result<()> {
        let width = usize::from(self.console.width());
        let used = title.chars().count() + 4;
        self.console.print("border", "── ")?;
        self.console.print(style, title)?;
        self.console.print("border", &format!(" {}", "─".repeat(width.saturating_sub(used))))?;
        self.console.newline()
    }

    fn print_markdown(&mut self, source: &str) -> io::Result<()> {
        let lines = markdown::render(source, self.console.theme());
        for line in &lines {
            self.console.print_line(line)?;
        }
        Ok(())
    }

    /// Replace the live region with the current buffer. Once the buffer no
    /// longer fits on screen a one-line progress note is shown instead.
    fn redraw(&mut self) -> io::Result<()> {
        self.clear_live()?;
        let lines = markdown::render(&self.buffer, self.console.theme());
        let rows = markdown::rows_for(&lines, self.console.width());
        let room = usize::from(self.console.height().saturating_sub(2));
        if rows <= room {
            for line in &lines {
                self.console.print_line(line)?;
            }
            self.live_rows = u16::try_from(rows).unwrap_or(u16::MAX);
        } else {
            let note = format!("… receiving response ({} chars)", self.buffer.chars().count());
            self.console.print("thinking", &note)?;
            self.console.newline()?;
            self.live_rows = 1;
        }
        self.last_draw = Some(Instant::now());
        self.console.flush()
    }

    fn clear_live(&mut self) -> io::Result<()> {
        let rows = std::mem::take(&mut self.live_rows);
        self.console.erase_rows(rows)
    }

    /// Finalise whatever is streaming: drop the live region and print the
    /// buffered markdown once.
    fn settle(&mut self) -> io::Result<()> {
        self.clear_live()?;
        if self.raw_pending {
            self.console.newline()?;
            self.raw_pending = false;
        }
        if self.use_markdown && !self.buffer.is_empty() {
            let source = std::mem::take(&mut self.buffer);
            self.print_markdown(&source)?;
        }
        Ok(())
    }
}
