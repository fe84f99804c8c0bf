use crate::alerts::{Admission, Notifier, RateLimiter};
use crate::collectors::{
    MessageReassembler, PatternStart, PollingTail, RawLine, StartDetector, TailMode,
    UnindentedStart,
};
use crate::error::{CollectorError, ConfigError, ReportError};
use crate::events::{LogicalMessage, StartMatch, Timestamp, WILDCARD_LEVEL};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Start of a `YYYY-MM-DD HH:MM:SS,mmm LEVEL ` entry
pub const DEFAULT_START_PATTERN: &str =
    r"^(?P<date>\d{4}-\d\d-\d\d) (?P<time>\d\d:\d\d:\d\d,\d{3}) (?P<level>\w+) ";

/// Start of an entry whose header carries only date and time
pub const DATE_START_PATTERN: &str =
    r"^(?P<date>\d{4}-\d\d-\d\d)[ T](?P<time>\d\d:\d\d:\d\d(?:[.,]\d+)?)";

pub const DEFAULT_MAX_LOG_LENGTH: usize = 2048;

/// How entries are recognised and classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Level taken from the entry header
    Default,
    /// Every unindented line starts an entry; everything is reported
    #[serde(rename = "all")]
    MatchAll,
    /// Date/time header, level is the first word of the second line
    DateLevel,
}

impl LogFormat {
    /// Whether the format filters by the configured levels
    pub fn uses_levels(&self) -> bool {
        !matches!(self, LogFormat::MatchAll)
    }

    /// Start pattern used when none is configured
    pub fn default_pattern(&self) -> Option<&'static str> {
        match self {
            LogFormat::Default => Some(DEFAULT_START_PATTERN),
            LogFormat::DateLevel => Some(DATE_START_PATTERN),
            LogFormat::MatchAll => None,
        }
    }

    /// Build the start detector for this format
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPattern` if the built-in pattern fails to compile.
    pub fn start_detector(
        &self,
        custom: Option<&Regex>,
    ) -> Result<Box<dyn StartDetector>, ConfigError> {
        let pattern = match (custom, self.default_pattern()) {
            (_, None) => return Ok(Box::new(UnindentedStart)),
            (Some(custom), Some(_)) => custom.clone(),
            (None, Some(pattern)) => {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?
            }
        };
        Ok(Box::new(PatternStart::new(pattern)))
    }
}

/// Limit on deliveries per sliding window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub n: usize,
    pub t_secs: f64,
}

/// Everything needed to build a [`LogReporter`]
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub name: String,
    pub path: PathBuf,
    pub format: LogFormat,
    pub start_pattern: Option<Regex>,
    /// Allow-list of levels; `*` counts and reports every entry
    pub levels: Vec<String>,
    pub rate_limit: Option<RateLimit>,
    pub max_log_length: usize,
    pub poll_interval: Duration,
}

impl ReporterSettings {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, format: LogFormat) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            format,
            start_pattern: None,
            levels: Vec::new(),
            rate_limit: None,
            max_log_length: DEFAULT_MAX_LOG_LENGTH,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_levels<S: AsRef<str>>(mut self, levels: &[S]) -> Self {
        self.levels = levels.iter().map(|l| l.as_ref().to_string()).collect();
        self
    }

    pub fn with_rate_limit(mut self, n: usize, t_secs: f64) -> Self {
        self.rate_limit = Some(RateLimit { n, t_secs });
        self
    }

    pub fn with_max_log_length(mut self, max_log_length: usize) -> Self {
        self.max_log_length = max_log_length;
        self
    }

    pub fn with_start_pattern(mut self, pattern: Regex) -> Self {
        self.start_pattern = Some(pattern);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Counters surfaced by `status()`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReporterStats {
    /// Reported entries per level (including `*`)
    pub counters: BTreeMap<String, u64>,
    /// Entries held back by the rate limiter
    pub suppressed: u64,
    /// Entries whose header could not be parsed
    pub parse_errors: u64,
    /// Header time of the most recent entry
    pub last_entry: Option<NaiveDateTime>,
}

impl ReporterStats {
    /// Render the counters as `ERROR=1 INFO=1`
    pub fn summary(&self) -> String {
        let mut summary = if self.counters.is_empty() {
            "no messages".to_string()
        } else {
            self.counters
                .iter()
                .map(|(level, count)| format!("{}={}", level, count))
                .collect::<Vec<_>>()
                .join(" ")
        };
        if self.suppressed > 0 {
            summary.push_str(&format!(", {} suppressed", self.suppressed));
        }
        if self.parse_errors > 0 {
            summary.push_str(&format!(", {} unparsed", self.parse_errors));
        }
        if let Some(last) = self.last_entry {
            summary.push_str(&format!(", last entry {}", last.format("%Y-%m-%d %H:%M:%S")));
        }
        summary
    }
}

/// Receives every classified entry before rate limiting
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn log_received(&self, level: &str, name: &str, message: &str);
}

/// Truncate to at most `max_length` bytes on a character boundary, marking the cut with `...`
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let mut cut = max_length.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Parse the header date/time of an entry, if it has one
fn entry_time(start: &StartMatch) -> Result<Option<NaiveDateTime>, ReportError> {
    let (Some(date), Some(time)) = (&start.date, &start.time) else {
        return Ok(None);
    };

    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| ReportError::Parse(format!("invalid date '{}': {}", date, e)))?;
    let normalized = time.replace(',', ".");
    let clock = NaiveTime::parse_from_str(&normalized, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(&normalized, "%H:%M:%S"))
        .map_err(|e| ReportError::Parse(format!("invalid time '{}': {}", time, e)))?;

    Ok(Some(day.and_time(clock)))
}

/// Classification, counting, rate limiting and delivery of reassembled entries
pub struct ReportPipeline {
    name: String,
    format: LogFormat,
    levels: Vec<String>,
    max_log_length: usize,
    rate_limit: Option<RateLimit>,
    limiter: Option<RateLimiter>,
    notifier: Arc<dyn Notifier>,
    sinks: Vec<Arc<dyn EventSink>>,
    stats: Arc<Mutex<ReporterStats>>,
}

impl ReportPipeline {
    pub fn new(settings: &ReporterSettings, notifier: Arc<dyn Notifier>) -> Self {
        let levels = if settings.format.uses_levels() {
            settings.levels.clone()
        } else {
            vec![WILDCARD_LEVEL.to_string()]
        };

        Self {
            name: settings.name.clone(),
            format: settings.format,
            levels,
            max_log_length: settings.max_log_length,
            rate_limit: settings.rate_limit,
            limiter: settings
                .rate_limit
                .map(|limit| RateLimiter::with_window_secs(limit.n, limit.t_secs)),
            notifier,
            sinks: Vec::new(),
            stats: Arc::new(Mutex::new(ReporterStats::default())),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Shared handle to the counters
    pub fn stats_handle(&self) -> Arc<Mutex<ReporterStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> ReporterStats {
        self.lock_stats().clone()
    }

    /// Level of an entry as seen by this format
    fn detected_level<'a>(&self, message: &'a LogicalMessage) -> Option<&'a str> {
        match self.format {
            LogFormat::Default => message.start.level.as_deref(),
            LogFormat::MatchAll => None,
            LogFormat::DateLevel => message
                .text
                .lines()
                .nth(1)
                .and_then(|line| line.split_whitespace().next())
                .map(|word| word.trim_end_matches(':')),
        }
    }

    /// Levels to count and the level to report under, or `None` to ignore the entry
    fn classify(&self, message: &LogicalMessage) -> Option<(Vec<String>, String)> {
        let level = self
            .detected_level(message)
            .filter(|level| self.levels.iter().any(|l| l == level));
        let wildcard = self.levels.iter().any(|l| l == WILDCARD_LEVEL);

        match (level, wildcard) {
            (Some(level), true) => Some((
                vec![WILDCARD_LEVEL.to_string(), level.to_string()],
                level.to_string(),
            )),
            (Some(level), false) => Some((vec![level.to_string()], level.to_string())),
            (None, true) => Some((
                vec![WILDCARD_LEVEL.to_string()],
                WILDCARD_LEVEL.to_string(),
            )),
            (None, false) => None,
        }
    }

    /// Process one entry at `now`
    ///
    /// # Errors
    ///
    /// Returns `ReportError::Parse` for a malformed header and
    /// `ReportError::Delivery` if the notifier rejects a message. Counters are
    /// only updated for well-formed entries.
    pub fn handle_at(
        &mut self,
        message: &LogicalMessage,
        now: Timestamp,
    ) -> Result<(), ReportError> {
        let time = entry_time(&message.start).map_err(|e| {
            self.lock_stats().parse_errors += 1;
            e
        })?;

        let Some((counted, level)) = self.classify(message) else {
            debug!("{}: ignoring entry {:?}", self.name, message.start.level);
            return Ok(());
        };

        {
            let mut stats = self.lock_stats();
            for counted_level in counted {
                *stats.counters.entry(counted_level).or_insert(0) += 1;
            }
            if time.is_some() {
                stats.last_entry = time;
            }
        }

        for sink in &self.sinks {
            sink.log_received(&level, &self.name, &message.text);
        }

        let admission = match self.limiter.as_mut() {
            Some(limiter) => limiter.admit_at(now),
            None => Admission::Deliver {
                suppressed_before: 0,
            },
        };

        match admission {
            Admission::Deliver { suppressed_before } => {
                if suppressed_before > 0 {
                    let noun = if suppressed_before == 1 {
                        "message"
                    } else {
                        "messages"
                    };
                    self.notifier.notify(&format!(
                        "{}: {} {} not shown",
                        self.name, suppressed_before, noun
                    ))?;
                }
                let text = format!(
                    "{}: {}:\n{}",
                    level,
                    self.name,
                    truncate_text(&message.text, self.max_log_length)
                );
                self.notifier.notify(&text)?;
            }
            Admission::Suppressed { first } => {
                self.lock_stats().suppressed += 1;
                if let (true, Some(limit)) = (first, self.rate_limit) {
                    warn!("{}: rate limit reached", self.name);
                    self.notifier.notify(&format!(
                        "Rate limiting messages from {} (more than {} in {}s)",
                        self.name, limit.n, limit.t_secs
                    ))?;
                }
            }
        }
        Ok(())
    }

    /// Process one entry, reporting failures instead of returning them
    pub fn process(&mut self, message: &LogicalMessage) {
        if let Err(e) = self.handle_at(message, Utc::now()) {
            error!("{}: failed to process log entry: {}", self.name, e);
            let text = format!("Log parsing error ({}): {}", self.name, e);
            if let Err(e) = self.notifier.notify(&text) {
                error!("{}: failed to report parsing error: {}", self.name, e);
            }
        }
    }

    /// Feed a finite batch of raw lines, flushing the last entry at the end
    pub fn consume<I>(&mut self, reassembler: &mut MessageReassembler, lines: I)
    where
        I: IntoIterator<Item = RawLine>,
    {
        for line in lines {
            if let Some(message) = reassembler.push(line) {
                self.process(&message);
            }
        }
        if let Some(message) = reassembler.flush() {
            self.process(&message);
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, ReporterStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Follows one log file and reports its entries
///
/// Tailing, reassembly and classification all run on one background thread;
/// the reporter itself only keeps the shared counters for `status()`.
pub struct LogReporter {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
    stats: Arc<Mutex<ReporterStats>>,
    /// Taken by the worker thread on start
    pipeline: Option<(ReportPipeline, Box<dyn StartDetector>)>,
    running: Arc<Mutex<bool>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl LogReporter {
    /// Create a reporter; nothing is read until [`LogReporter::start`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPattern` if the start pattern cannot be built.
    pub fn new(
        settings: ReporterSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        let detector = settings
            .format
            .start_detector(settings.start_pattern.as_ref())?;
        let pipeline = ReportPipeline::new(&settings, notifier);

        Ok(Self {
            name: settings.name,
            path: settings.path,
            poll_interval: settings.poll_interval,
            stats: pipeline.stats_handle(),
            pipeline: Some((pipeline, detector)),
            running: Arc::new(Mutex::new(false)),
            thread_handle: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward every classified entry to `sink`; only effective before start
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        match self.pipeline.as_mut() {
            Some((pipeline, _)) => pipeline.add_sink(sink),
            None => warn!("{}: cannot add a sink to a running reporter", self.name),
        }
    }

    pub fn stats(&self) -> ReporterStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `name (path): LEVEL=count ...`
    pub fn status(&self) -> String {
        format!(
            "{} ({}): {}",
            self.name,
            self.path.display(),
            self.stats().summary()
        )
    }

    /// Start following the file on a background thread
    ///
    /// Reading starts at the current end of the file.
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::IoError` if the thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        let Some((pipeline, detector)) = self.pipeline.take() else {
            info!("{}: reporter already started", self.name);
            return Ok(());
        };
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = true;

        let tail = PollingTail::new(&self.path, self.poll_interval, TailMode::NonBlocking);
        let reassembler = MessageReassembler::new(detector);
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;

        info!("{}: following {}", self.name, self.path.display());
        let handle = thread::Builder::new()
            .name(format!("log:{}", self.name))
            .spawn(move || {
                Self::reporter_thread(pipeline, tail, reassembler, running, poll_interval)
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Ask the worker thread to stop after its current poll cycle
    pub fn stop(&mut self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
        // Detach: a source that never answers must not hold up shutdown
        self.thread_handle.take();
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reporter_thread(
        mut pipeline: ReportPipeline,
        mut tail: PollingTail,
        mut reassembler: MessageReassembler,
        running: Arc<Mutex<bool>>,
        poll_interval: Duration,
    ) {
        while *running.lock().unwrap_or_else(PoisonError::into_inner) {
            for line in tail.poll() {
                if let Some(message) = reassembler.push(line) {
                    pipeline.process(&message);
                }
            }
            thread::sleep(poll_interval);
        }
        debug!(
            "{}: reporter thread finished after {} lines",
            pipeline.name,
            tail.cursor().lines_read
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::notifier::MockNotifier;
    use crate::alerts::QueuedNotifier;
    use crate::error::AlertError;
    use chrono::TimeZone;
    use std::io::Write;
    use std::sync::mpsc::Receiver;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn line(text: &str) -> RawLine {
        RawLine::Line(text.to_string())
    }

    fn entry(level: &str, text: &str) -> LogicalMessage {
        LogicalMessage::new(
            format!("2024-01-01 10:00:00,000 {} {}\n", level, text),
            StartMatch {
                level: Some(level.to_string()),
                date: Some("2024-01-01".to_string()),
                time: Some("10:00:00,000".to_string()),
            },
        )
    }

    fn pipeline(
        settings: &ReporterSettings,
    ) -> (ReportPipeline, MessageReassembler, Receiver<String>) {
        let (notifier, receiver) = QueuedNotifier::new();
        let pipeline = ReportPipeline::new(settings, Arc::new(notifier));
        let detector = settings
            .format
            .start_detector(settings.start_pattern.as_ref())
            .unwrap();
        (pipeline, MessageReassembler::new(detector), receiver)
    }

    #[test]
    fn test_multiline_entries_reported_by_level() {
        let settings = ReporterSettings::new("server", "/var/log/server.log", LogFormat::Default)
            .with_levels(&["ERROR", "INFO"]);
        let (mut pipeline, mut reassembler, receiver) = pipeline(&settings);

        pipeline.consume(
            &mut reassembler,
            vec![
                line("2024-01-01 10:00:00,000 ERROR boom\n"),
                line(" stacktrace line\n"),
                line("2024-01-01 10:00:01,000 INFO ok\n"),
            ],
        );

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert_eq!(
            delivered,
            vec![
                "ERROR: server:\n2024-01-01 10:00:00,000 ERROR boom\n stacktrace line\n",
                "INFO: server:\n2024-01-01 10:00:01,000 INFO ok\n",
            ]
        );

        let stats = pipeline.stats();
        assert_eq!(stats.counters.get("ERROR"), Some(&1));
        assert_eq!(stats.counters.get("INFO"), Some(&1));
        assert_eq!(stats.counters.len(), 2);
        assert_eq!(
            stats.summary(),
            "ERROR=1 INFO=1, last entry 2024-01-01 10:00:01"
        );
    }

    #[test]
    fn test_levels_outside_allow_list_are_ignored() {
        let settings =
            ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
                .with_levels(&["ERROR"]);
        let (mut pipeline, _, receiver) = pipeline(&settings);

        pipeline.handle_at(&entry("DEBUG", "noise"), at(0)).unwrap();
        assert!(receiver.try_recv().is_err());
        assert!(pipeline.stats().counters.is_empty());
        assert_eq!(pipeline.stats().summary(), "no messages");
    }

    #[test]
    fn test_wildcard_counts_everything() {
        let settings = ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
            .with_levels(&["*", "ERROR"]);
        let (mut pipeline, _, receiver) = pipeline(&settings);

        pipeline.handle_at(&entry("DEBUG", "noise"), at(0)).unwrap();
        pipeline.handle_at(&entry("ERROR", "boom"), at(1)).unwrap();

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert!(delivered[0].starts_with("*: server:\n"));
        assert!(delivered[1].starts_with("ERROR: server:\n"));

        let stats = pipeline.stats();
        assert_eq!(stats.counters.get("*"), Some(&2));
        assert_eq!(stats.counters.get("ERROR"), Some(&1));
    }

    #[test]
    fn test_match_all_format() {
        let settings = ReporterSettings::new("py", "/tmp/py.log", LogFormat::MatchAll);
        let (mut pipeline, mut reassembler, receiver) = pipeline(&settings);

        pipeline.consume(
            &mut reassembler,
            vec![
                line("Traceback (most recent call last):\n"),
                line("  File \"x.py\", line 1\n"),
                line("ValueError: bad\n"),
            ],
        );

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert_eq!(delivered.len(), 2);
        assert_eq!(
            delivered[0],
            "*: py:\nTraceback (most recent call last):\n  File \"x.py\", line 1\n"
        );
        assert_eq!(pipeline.stats().counters.get("*"), Some(&2));
    }

    #[test]
    fn test_date_level_format_reads_level_from_second_line() {
        let settings = ReporterSettings::new("java", "/tmp/j.log", LogFormat::DateLevel)
            .with_levels(&["SEVERE"]);
        let (mut pipeline, mut reassembler, receiver) = pipeline(&settings);

        pipeline.consume(
            &mut reassembler,
            vec![
                line("2024-01-01 10:00:00 org.example.Server start\n"),
                line("SEVERE: could not bind\n"),
                line("2024-01-01 10:00:01 org.example.Server start\n"),
                line("INFO: retrying\n"),
            ],
        );

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].starts_with("SEVERE: java:\n2024-01-01 10:00:00"));
        assert_eq!(pipeline.stats().counters.get("SEVERE"), Some(&1));
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let settings = ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
            .with_levels(&["ERROR"])
            .with_max_log_length(40);
        let (mut pipeline, _, receiver) = pipeline(&settings);

        pipeline
            .handle_at(&entry("ERROR", &"x".repeat(100)), at(0))
            .unwrap();

        let delivered = receiver.try_recv().unwrap();
        let body = delivered.strip_prefix("ERROR: server:\n").unwrap();
        assert_eq!(body.len(), 40);
        assert!(body.ends_with("..."));
    }

    #[test]
    fn test_truncate_text_respects_char_boundaries() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("hello world", 8), "hello...");
        // "é" is two bytes; cutting at byte 4 would split it
        assert_eq!(truncate_text("aaaéééé", 7), "aaa...");
    }

    #[test]
    fn test_rate_limit_notices() {
        // n=2, t=10s; entries at 0, 1, 2, 11
        let settings = ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
            .with_levels(&["ERROR"])
            .with_rate_limit(2, 10.0);
        let (mut pipeline, _, receiver) = pipeline(&settings);

        for (secs, text) in [(0, "a"), (1, "b"), (2, "c"), (11, "d")] {
            pipeline.handle_at(&entry("ERROR", text), at(secs)).unwrap();
        }

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert_eq!(delivered.len(), 5);
        assert!(delivered[0].ends_with("ERROR a\n"));
        assert!(delivered[1].ends_with("ERROR b\n"));
        assert_eq!(
            delivered[2],
            "Rate limiting messages from server (more than 2 in 10s)"
        );
        assert_eq!(delivered[3], "server: 1 message not shown");
        assert!(delivered[4].ends_with("ERROR d\n"));

        let stats = pipeline.stats();
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.counters.get("ERROR"), Some(&4));
    }

    #[test]
    fn test_sinks_see_suppressed_and_untruncated_entries() {
        let settings = ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
            .with_levels(&["ERROR"])
            .with_rate_limit(1, 60.0)
            .with_max_log_length(10);
        let (mut pipeline, _, _receiver) = pipeline(&settings);

        let mut sink = MockEventSink::new();
        sink.expect_log_received()
            .withf(|level, name, message| {
                level == "ERROR" && name == "server" && message.len() > 10
            })
            .times(3)
            .return_const(());
        pipeline.add_sink(Arc::new(sink));

        for secs in 0..3 {
            pipeline
                .handle_at(&entry("ERROR", "a long message body"), at(secs))
                .unwrap();
        }
    }

    #[test]
    fn test_malformed_header_reported_and_processing_continues() {
        let settings =
            ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
                .with_levels(&["ERROR"]);
        let (mut pipeline, mut reassembler, receiver) = pipeline(&settings);

        pipeline.consume(
            &mut reassembler,
            vec![
                line("2024-13-45 10:00:00,000 ERROR impossible date\n"),
                line("2024-01-01 10:00:01,000 ERROR real problem\n"),
            ],
        );

        let delivered: Vec<String> = receiver.try_iter().collect();
        assert_eq!(delivered.len(), 2);
        assert!(delivered[0].starts_with("Log parsing error (server): malformed entry header"));
        assert!(delivered[1].ends_with("ERROR real problem\n"));

        let stats = pipeline.stats();
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.counters.get("ERROR"), Some(&1));
        assert_eq!(
            stats.summary(),
            "ERROR=1, 1 unparsed, last entry 2024-01-01 10:00:01"
        );
    }

    #[test]
    fn test_notifier_failure_is_surfaced() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_| Err(AlertError::ChannelClosed));

        let settings =
            ReporterSettings::new("server", "/tmp/s.log", LogFormat::Default)
                .with_levels(&["ERROR"]);
        let mut pipeline = ReportPipeline::new(&settings, Arc::new(notifier));

        assert!(matches!(
            pipeline.handle_at(&entry("ERROR", "boom"), at(0)),
            Err(ReportError::Delivery(AlertError::ChannelClosed))
        ));
        // process() swallows it
        pipeline.process(&entry("ERROR", "boom"));
        assert_eq!(pipeline.stats().counters.get("ERROR"), Some(&2));
    }

    #[test]
    fn test_reporter_follows_appended_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "2024-01-01 09:00:00,000 ERROR history\n").unwrap();

        let (notifier, receiver) = QueuedNotifier::new();
        let settings = ReporterSettings::new("server", &path, LogFormat::Default)
            .with_levels(&["ERROR"])
            .with_poll_interval(Duration::from_millis(20));
        let mut reporter = LogReporter::new(settings, Arc::new(notifier)).unwrap();
        reporter.start().unwrap();
        assert!(reporter.is_running());

        // Let the first poll position the cursor at the end of the history
        thread::sleep(Duration::from_millis(100));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2024-01-01 10:00:00,000 ERROR fresh\n").unwrap();
        file.flush().unwrap();

        let delivered = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            delivered,
            "ERROR: server:\n2024-01-01 10:00:00,000 ERROR fresh\n"
        );

        reporter.stop();
        assert!(!reporter.is_running());
        assert!(reporter.status().ends_with("ERROR=1, last entry 2024-01-01 10:00:00"));
    }

    #[test]
    fn test_reporter_on_idle_fifo_stops_promptly() {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pipe");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let (notifier, _receiver) = QueuedNotifier::new();
        let settings = ReporterSettings::new("server", &path, LogFormat::Default)
            .with_levels(&["ERROR"])
            .with_poll_interval(Duration::from_millis(20));
        let mut reporter = LogReporter::new(settings, Arc::new(notifier)).unwrap();
        reporter.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        let (done, stopped) = std::sync::mpsc::channel();
        thread::spawn(move || {
            reporter.stop();
            done.send(reporter.is_running()).unwrap();
        });
        assert_eq!(stopped.recv_timeout(Duration::from_secs(3)), Ok(false));
    }
}
