//! Core event types shared across the pipeline
//!
//! This module defines the data that flows from the tail/reassembler stage into
//! reporters, and from reporters into alert aggregators.

use chrono::{DateTime, Utc};

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Level name that matches and counts every message regardless of its detected level
pub const WILDCARD_LEVEL: &str = "*";

/// Fields captured from the first line of a log entry by a start detector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartMatch {
    /// Severity level (e.g. `ERROR`), if the pattern captured one
    pub level: Option<String>,
    /// Date portion of the entry header
    pub date: Option<String>,
    /// Time portion of the entry header
    pub time: Option<String>,
}

/// A complete, possibly multi-line, log entry
///
/// Only produced once the start of the following entry (or an idle period)
/// confirmed that no further continuation lines belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// All lines of the entry, each with its original terminator
    pub text: String,
    /// Fields extracted from the entry's first line
    pub start: StartMatch,
}

impl LogicalMessage {
    pub fn new(first_line: String, start: StartMatch) -> Self {
        Self {
            text: first_line,
            start,
        }
    }

    /// Append a continuation line (terminator included)
    pub fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
    }

    /// Number of lines in the entry
    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

/// A classified log message handed to alert aggregators
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    /// Level the message was classified under
    pub level: String,
    /// Display name of the reporter that produced it
    pub name: String,
    /// Full message text
    pub message: String,
    /// When the aggregator accepted the event
    pub received: Timestamp,
}

impl AlertEvent {
    /// Render as `LEVEL: name:\nmessage`
    pub fn format(&self) -> String {
        format!("{}: {}:\n{}", self.level, self.name, self.message)
    }
}
