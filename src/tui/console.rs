use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crossterm::cursor::MoveToPreviousLine;
use crossterm::queue;
use crossterm::style::{Color, ContentStyle, Print, PrintStyledContent, Stylize};
use crossterm::terminal::{self, Clear, ClearType};

/// Named styles used across the shell.
#[derive(Debug, Clone)]
pub struct Theme {
    styles: HashMap<&'static str, ContentStyle>,
}

impl Default for Theme {
    fn default() -> Self {
        let s = ContentStyle::new;
        let styles = HashMap::from([
            ("assistant", s().with(Color::Cyan).bold()),
            ("user", s().with(Color::Green).bold()),
            ("system", s().with(Color::Yellow).bold()),
            ("agent", s().with(Color::Magenta).bold()),
            ("success", s().with(Color::Green).bold()),
            ("error", s().with(Color::Red).bold()),
            ("warning", s().with(Color::Yellow).bold()),
            ("info", s().with(Color::Blue).bold()),
            ("thinking", s().with(Color::Cyan).italic()),
            ("working", s().with(Color::Blue).bold()),
            ("done", s().with(Color::Green).bold()),
            ("failed", s().with(Color::Red).bold()),
            ("code", s().with(Color::White).on(Color::AnsiValue(237))),
            ("command", s().with(Color::Cyan).bold()),
            ("path", s().with(Color::Blue).underlined()),
            ("prompt", s().with(Color::White).bold()),
            ("border", s().with(Color::Grey).dim()),
            ("highlight", s().with(Color::White).bold()),
            ("dim", s().with(Color::Grey).dim()),
            ("stat.label", s().with(Color::Cyan).dim()),
            ("stat.value", s().with(Color::White).bold()),
            ("markdown.h1", s().with(Color::Magenta).bold().underlined()),
            ("markdown.h", s().with(Color::Magenta).bold()),
            ("markdown.em", s().italic()),
            ("markdown.strong", s().bold()),
            ("markdown.strike", s().crossed_out()),
            ("markdown.link", s().with(Color::Blue).underlined()),
            ("markdown.quote", s().with(Color::Grey).italic()),
            ("markdown.bullet", s().with(Color::Yellow).bold()),
        ]);
        Self { styles }
    }
}

impl Theme {
    pub fn style(&self, name: &str) -> ContentStyle {
        self.styles.get(name).copied().unwrap_or_default()
    }
}

/// Layer `top` over `base`: colors override, attributes accumulate.
pub fn merge_styles(base: ContentStyle, top: ContentStyle) -> ContentStyle {
    let mut out = base;
    if top.foreground_color.is_some() {
        out.foreground_color = top.foreground_color;
    }
    if top.background_color.is_some() {
        out.background_color = top.background_color;
    }
    out.attributes.extend(top.attributes);
    out
}

/// A run of text in a single style.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub text: String,
    pub style: ContentStyle,
}

impl Span {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: ContentStyle::new(),
        }
    }

    pub fn styled(text: impl Into<String>, style: ContentStyle) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

pub type Line = Vec<Span>;

/// The rendering surface. Created once by the entry point and handed to
/// whatever renders.
pub struct Console {
    out: Box<dyn Write + Send>,
    theme: Theme,
    color: bool,
    live: bool,
}

impl Console {
    /// Stdout, styled and live-updating only when it is a terminal and
    /// `NO_COLOR` is unset.
    pub fn stdout(theme: Theme) -> Self {
        let tty = io::stdout().is_terminal();
        let color = tty && std::env::var_os("NO_COLOR").is_none();
        Self {
            out: Box::new(io::stdout()),
            theme,
            color,
            live: tty,
        }
    }

    /// Plain, non-live output into any writer.
    pub fn from_writer(out: impl Write + Send + 'static, theme: Theme) -> Self {
        Self {
            out: Box::new(out),
            theme,
            color: false,
            live: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Terminal width, or 80 columns when it cannot be queried.
    pub fn width(&self) -> u16 {
        if self.live {
            terminal::size().map(|(w, _)| w).unwrap_or(80)
        } else {
            80
        }
    }

    pub fn height(&self) -> u16 {
        if self.live {
            terminal::size().map(|(_, h)| h).unwrap_or(24)
        } else {
            24
        }
    }

    pub fn print(&mut self, style: &str, text: &str) -> io::Result<()> {
        let style = self.theme.style(style);
        self.print_span(&Span::styled(text, style))
    }

    pub fn print_span(&mut self, span: &Span) -> io::Result<()> {
        if self.color && span.style != ContentStyle::new() {
            queue!(self.out, PrintStyledContent(span.style.apply(span.text.as_str())))
        } else {
            queue!(self.out, Print(&span.text))
        }
    }

    pub fn print_line(&mut self, line: &[Span]) -> io::Result<()> {
        for span in line {
            self.print_span(span)?;
        }
        self.newline()
    }

    pub fn newline(&mut self) -> io::Result<()> {
        queue!(self.out, Print("\n"))
    }

    /// Move up `rows` lines and clear everything below. No-op when the
    /// surface is not live.
    pub fn erase_rows(&mut self, rows: u16) -> io::Result<()> {
        if !self.live || rows == 0 {
            return Ok(());
        }
        queue!(
            self.out,
            MoveToPreviousLine(rows),
            Clear(ClearType::FromCursorDown)
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Cloneable in-memory writer, for capturing console output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::style::Attribute;

    #[test]
    fn plain_console_writes_no_escape_codes() {
        let buf = SharedBuffer::default();
        let mut console = Console::from_writer(buf.clone(), Theme::default());
        console.print("error", "✗ Error:").unwrap();
        console.print("", " boom").unwrap();
        console.newline().unwrap();
        console.erase_rows(3).unwrap();
        console.flush().unwrap();
        assert_eq!(buf.contents(), "✗ Error: boom\n");
    }

    #[test]
    fn colored_console_emits_ansi() {
        let buf = SharedBuffer::default();
        let mut console = Console::from_writer(buf.clone(), Theme::default()).with_color(true);
        console.print("error", "bad").unwrap();
        console.flush().unwrap();
        let out = buf.contents();
        assert!(out.contains("\x1b["));
        assert!(out.contains("bad"));
    }

    #[test]
    fn merge_keeps_attributes_and_overrides_colors() {
        let base = ContentStyle::new().with(Color::Red).bold();
        let top = ContentStyle::new().with(Color::Blue).italic();
        let merged = merge_styles(base, top);
        assert_eq!(merged.foreground_color, Some(Color::Blue));
        assert!(merged.attributes.has(Attribute::Bold));
        assert!(merged.attributes.has(Attribute::Italic));
    }

    #[test]
    fn unknown_style_is_plain() {
        assert_eq!(Theme::default().style("nope"), ContentStyle::new());
    }
}
