//! Rendering of bus messages into the aggregated output stream.
//!
//! Each message becomes one line: the task identity (styled and padded to a shared
//! column), a marker, and the content. Log and error lines go through structured-log
//! extraction first; control messages are rendered as-is with their own marker.

use std::io::Write;

use crossterm::style::{Color, Stylize};
use strip_ansi_escapes::strip;

use crate::message::{Kind, Message};
use crate::structured;
use crate::style::Styles;

/// Turns messages into display lines for one run.
#[derive(Debug, Clone)]
pub struct Formatter {
    styles: Styles,
    color: bool,
}

impl Formatter {
    pub fn new(styles: Styles, color: bool) -> Self {
        Self { styles, color }
    }

    pub fn render(&self, message: &Message) -> String {
        let id = self
            .styles
            .style(&message.source)
            .paint(&self.styles.padded(&message.source), self.color);
        let content = sanitize_text(&message.content, !self.color);
        if message.kind.is_control() {
            let marker = match message.kind {
                Kind::Stopped => "■",
                Kind::Restarting => "⟳",
                _ => "◆ mem",
            };
            return format!("{} {} {}", id, marker, content);
        }
        let body = structured::parse(&content).render();
        match message.kind {
            Kind::Error if self.color => format!("{} !{}", id, body.with(Color::Red)),
            Kind::Error => format!("{} !{}", id, body),
            _ => format!("{} >{}", id, body),
        }
    }
}

/// Line-oriented sink for rendered output.
pub struct Output {
    writer: Box<dyn Write + Send>,
    formatter: Formatter,
}

impl Output {
    pub fn new(writer: Box<dyn Write + Send>, formatter: Formatter) -> Self {
        Self { writer, formatter }
    }

    /// Renders and writes one message, flushing so lines show up as they arrive.
    pub fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
        let line = self.formatter.render(message);
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A cloneable in-memory writer.
    #[derive(Clone, Default)]
    pub(crate) struct Shared(pub Arc<Mutex<Vec<u8>>>);

    impl Shared {
        pub(crate) fn lines(&self) -> Vec<String> {
            let raw = self.0.lock().unwrap();
            String::from_utf8_lossy(&raw)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn plain() -> Formatter {
        Formatter::new(Styles::assign(["api", "db-forward"]), false)
    }

    #[test]
    fn pads_identities_to_a_shared_column() {
        let formatter = plain();
        assert_eq!(
            formatter.render(&Message::new("api", Kind::Log, "listening")),
            "api        > listening"
        );
        assert_eq!(
            formatter.render(&Message::new("db-forward", Kind::Log, "ready")),
            "db-forward > ready"
        );
    }

    #[test]
    fn structured_lines_are_flattened() {
        let line = r#"{"level":"INFO","msg":"boot","time":"2024-03-01T10:15:30"}"#;
        assert_eq!(
            plain().render(&Message::new("api", Kind::Log, line)),
            "api        > [10:15:30] [INFO] msg=boot"
        );
    }

    #[test]
    fn control_messages_have_markers() {
        let formatter = plain();
        assert_eq!(
            formatter.render(&Message::stopped("api")),
            "api        ■ stopping"
        );
        assert_eq!(
            formatter.render(&Message::restarting("api")),
            "api        ⟳ restarting"
        );
        assert_eq!(
            formatter.render(&Message::new("api", Kind::Metric, "512 kB")),
            "api        ◆ mem 512 kB"
        );
        assert_eq!(
            formatter.render(&Message::new("api", Kind::Error, "boom")),
            "api        ! boom"
        );
    }

    #[test]
    fn control_content_skips_extraction() {
        let json = r#"{"level":"warn"}"#;
        assert_eq!(
            plain().render(&Message::new("api", Kind::Stopped, json)),
            format!("api        ■ {}", json)
        );
    }

    #[test]
    fn strips_ansi_without_color() {
        let line = "\u{1b}[32mgreen\u{1b}[0m";
        assert_eq!(
            plain().render(&Message::new("api", Kind::Log, line)),
            "api        > green"
        );
        let colored = Formatter::new(Styles::assign(["api"]), true)
            .render(&Message::new("api", Kind::Log, line));
        assert!(colored.contains(line));
        assert!(colored.contains("\u{1b}["));
    }

    #[test]
    fn writes_one_line_per_message() {
        let buffer = Shared::default();
        let mut output = Output::new(Box::new(buffer.clone()), plain());
        output
            .write_message(&Message::new("api", Kind::Log, "a"))
            .unwrap();
        output
            .write_message(&Message::new("api", Kind::Log, "b"))
            .unwrap();
        assert_eq!(buffer.lines(), vec!["api        > a", "api        > b"]);
    }
}
