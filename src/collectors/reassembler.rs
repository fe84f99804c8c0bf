//! Reassembly of multi-line log entries
//!
//! Log entries such as stack traces span several physical lines. The
//! reassembler keeps the entry currently being built and only releases it once
//! the first line of the following entry shows that it is complete.

use crate::collectors::tail::RawLine;
use crate::events::{LogicalMessage, StartMatch};
use regex::Regex;

/// Decides whether a line begins a new log entry
pub trait StartDetector: Send + Sync {
    /// `Some(fields)` for the first line of an entry, `None` for a continuation line
    fn detect(&self, line: &str) -> Option<StartMatch>;
}

impl<F> StartDetector for F
where
    F: Fn(&str) -> Option<StartMatch> + Send + Sync,
{
    fn detect(&self, line: &str) -> Option<StartMatch> {
        self(line)
    }
}

/// Start detector driven by a regular expression
///
/// Named groups `level`, `date` and `time` are copied into the [`StartMatch`].
#[derive(Debug, Clone)]
pub struct PatternStart {
    pattern: Regex,
}

impl PatternStart {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

impl StartDetector for PatternStart {
    fn detect(&self, line: &str) -> Option<StartMatch> {
        let caps = self.pattern.captures(line)?;
        let field = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        Some(StartMatch {
            level: field("level"),
            date: field("date"),
            time: field("time"),
        })
    }
}

/// Every line that does not begin with whitespace starts a new entry
#[derive(Debug, Clone, Copy, Default)]
pub struct UnindentedStart;

impl StartDetector for UnindentedStart {
    fn detect(&self, line: &str) -> Option<StartMatch> {
        match line.chars().next() {
            Some(c) if !c.is_whitespace() => Some(StartMatch::default()),
            _ => None,
        }
    }
}

/// Groups raw lines into [`LogicalMessage`]s, one message behind the input
pub struct MessageReassembler {
    detector: Box<dyn StartDetector>,
    /// Entry being built
    current: Option<LogicalMessage>,
    dropped_lines: u64,
}

impl MessageReassembler {
    pub fn new(detector: Box<dyn StartDetector>) -> Self {
        Self {
            detector,
            current: None,
            dropped_lines: 0,
        }
    }

    /// Feed one line; returns a message whose end has just been confirmed
    pub fn push(&mut self, line: RawLine) -> Option<LogicalMessage> {
        let text = match line {
            RawLine::Idle => return self.current.take(),
            RawLine::Line(text) => text,
        };

        match self.detector.detect(&text) {
            Some(start) => {
                let entry = LogicalMessage::new(text, start);
                // The new start confirms the end of the entry before it
                self.current.replace(entry)
            }
            None => {
                match self.current.as_mut() {
                    Some(current) => current.push_line(&text),
                    // Started in the middle of an entry
                    None => self.dropped_lines += 1,
                }
                None
            }
        }
    }

    /// Release the pending message at end of stream
    pub fn flush(&mut self) -> Option<LogicalMessage> {
        self.current.take()
    }

    /// Whether a message is waiting for its end to be confirmed
    pub fn has_pending(&self) -> bool {
        self.current.is_some()
    }

    /// Continuation lines that arrived before any entry start
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    /// Run a finite sequence of lines through the reassembler, flushing at the end
    pub fn collect_all<I>(&mut self, lines: I) -> Vec<LogicalMessage>
    where
        I: IntoIterator<Item = RawLine>,
    {
        let mut messages: Vec<LogicalMessage> =
            lines.into_iter().filter_map(|line| self.push(line)).collect();
        messages.extend(self.flush());
        messages
    }
}
