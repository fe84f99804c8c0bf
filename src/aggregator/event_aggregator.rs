//! Alert aggregation with settle delay and cooldown
//!
//! Reporters forward every classified entry to the aggregator. Entries that
//! match one of its conditions are buffered; once the first one arrives the
//! aggregator waits `delay` to gather related entries, sends them as a single
//! batch to every alerter, then stays quiet for `interval`. A buffer left
//! untouched for longer than `interval` is considered stale and discarded,
//! with the number of discarded entries mentioned in the next batch.

use crate::alerts::{AlertBatch, Alerter};
use crate::error::ConfigError;
use crate::events::{AlertEvent, Timestamp};
use crate::reporters::EventSink;
use chrono::Utc;
use log::{debug, info};
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll period while no new events are pending
pub const IDLE_POLL: Duration = Duration::from_secs(2);

/// Case-insensitive patterns for `(level, name, message)`; a missing pattern matches anything
#[derive(Debug, Clone)]
pub struct Condition {
    level: Option<Regex>,
    name: Option<Regex>,
    message: Option<Regex>,
}

impl Condition {
    /// Compile a condition; empty strings act as wildcards
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPattern` if any pattern fails to compile.
    pub fn new(level: &str, name: &str, message: &str) -> Result<Self, ConfigError> {
        fn compile(pattern: &str) -> Result<Option<Regex>, ConfigError> {
            if pattern.is_empty() {
                return Ok(None);
            }
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(Some)
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
        }

        Ok(Self {
            level: compile(level)?,
            name: compile(name)?,
            message: compile(message)?,
        })
    }

    /// Every present pattern must be found somewhere in its field
    pub fn matches(&self, level: &str, name: &str, message: &str) -> bool {
        let found = |pattern: &Option<Regex>, field: &str| {
            pattern.as_ref().map_or(true, |re| re.is_match(field))
        };
        found(&self.level, level) && found(&self.name, name) && found(&self.message, message)
    }
}

/// Buffered events waiting for the next alert
#[derive(Debug, Default)]
pub struct AggregationBuffer {
    events: VecDeque<AlertEvent>,
    last_event_time: Option<Timestamp>,
    discarded: u64,
    new_events: bool,
}

impl AggregationBuffer {
    /// Queue an event, first discarding the buffer if it went stale
    ///
    /// Returns the number of events discarded.
    pub fn push(&mut self, event: AlertEvent, interval: chrono::Duration) -> usize {
        let mut discarded = 0;
        if let Some(last) = self.last_event_time {
            if !self.events.is_empty() && event.received - last > interval {
                discarded = self.events.len();
                self.discarded += discarded as u64;
                self.events.clear();
            }
        }

        self.last_event_time = Some(event.received);
        self.events.push_back(event);
        self.new_events = true;
        discarded
    }

    /// Take everything buffered, with a preamble counting discarded events
    pub fn take_batch(&mut self) -> AlertBatch {
        let preamble = (self.discarded > 0)
            .then(|| format!("Suppressed events: {} not shown", self.discarded));
        self.discarded = 0;
        self.new_events = false;

        AlertBatch {
            preamble,
            events: self.events.drain(..).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn has_new_events(&self) -> bool {
        self.new_events
    }
}

/// Batches reportable events into throttled alerts
pub struct AlertAggregator {
    name: String,
    conditions: Vec<Condition>,
    delay: Duration,
    interval: Duration,
    /// `interval` as a buffer age limit
    staleness: chrono::Duration,
    idle_poll: Duration,
    alerters: Vec<Arc<dyn Alerter>>,
    buffer: Mutex<AggregationBuffer>,
    running: Mutex<bool>,
}

impl AlertAggregator {
    /// Create an aggregator
    ///
    /// # Arguments
    ///
    /// * `name` - Used in diagnostics only
    /// * `conditions` - An event is reportable if any condition matches
    /// * `delay` - Settle time between the first new event and the alert
    /// * `interval` - Cooldown after an alert, and the staleness limit of the buffer
    pub fn new(
        name: impl Into<String>,
        conditions: Vec<Condition>,
        delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            conditions,
            delay,
            interval,
            // Intervals beyond chrono's range never make the buffer stale
            staleness: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX),
            idle_poll: IDLE_POLL,
            alerters: Vec::new(),
            buffer: Mutex::new(AggregationBuffer::default()),
            running: Mutex::new(false),
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn add_alerter(&mut self, alerter: Arc<dyn Alerter>) {
        self.alerters.push(alerter);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alerters(&self) -> &[Arc<dyn Alerter>] {
        &self.alerters
    }

    pub fn reportable(&self, level: &str, name: &str, message: &str) -> bool {
        self.conditions
            .iter()
            .any(|condition| condition.matches(level, name, message))
    }

    /// Offer an event received at `now`; returns whether it was buffered
    pub fn log_received_at(&self, level: &str, name: &str, message: &str, now: Timestamp) -> bool {
        if !self.reportable(level, name, message) {
            return false;
        }

        let discarded = self.lock_buffer().push(
            AlertEvent {
                level: level.to_string(),
                name: name.to_string(),
                message: message.to_string(),
                received: now,
            },
            self.staleness,
        );
        if discarded > 0 {
            info!("{}: discarding {} stale events", self.name, discarded);
        }
        debug!("{}: buffered {} event from {}", self.name, level, name);
        true
    }

    pub fn has_new_events(&self) -> bool {
        self.lock_buffer().has_new_events()
    }

    pub fn pending(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Take the current batch without sending it
    pub fn flush(&self) -> AlertBatch {
        self.lock_buffer().take_batch()
    }

    /// Flush the buffer and hand the batch to every alerter
    pub fn alert(&self) {
        let batch = self.flush();
        if batch.is_empty() {
            return;
        }

        for alerter in &self.alerters {
            debug!("{}: alerting via {}", self.name, alerter.name());
            alerter.alert(&batch);
        }
    }

    /// One iteration of the aggregation loop; returns whether an alert was sent
    pub fn run_cycle(&self) -> bool {
        if !self.has_new_events() {
            thread::sleep(self.idle_poll);
            return false;
        }

        debug!("{}: waiting {:?} before alerting", self.name, self.delay);
        thread::sleep(self.delay);
        self.alert();

        debug!("{}: cooling down for {:?}", self.name, self.interval);
        thread::sleep(self.interval);
        // Events buffered during the cooldown wait for the next reportable one
        self.lock_buffer().new_events = false;
        true
    }

    /// Run the aggregation loop on a background thread
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = true;
        info!(
            "Starting aggregator {} (delay {:?}, interval {:?})",
            self.name, self.delay, self.interval
        );

        let aggregator = Arc::clone(self);
        thread::Builder::new()
            .name(format!("aggregate:{}", self.name))
            .spawn(move || {
                while aggregator.is_running() {
                    aggregator.run_cycle();
                }
                info!("Aggregator {} stopped", aggregator.name);
            })
    }

    pub fn stop(&self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, AggregationBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for AlertAggregator {
    fn log_received(&self, level: &str, name: &str, message: &str) {
        self.log_received_at(level, name, message, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::email::MockAlerter;
    use chrono::TimeZone;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn errors_only(interval_secs: u64) -> AlertAggregator {
        AlertAggregator::new(
            "ops",
            vec![Condition::new("error", "", "").unwrap()],
            Duration::ZERO,
            Duration::from_secs(interval_secs),
        )
        .with_idle_poll(Duration::ZERO)
    }

    #[test]
    fn test_conditions_are_case_insensitive_searches() {
        let condition = Condition::new("err", "^server$", "out of memory").unwrap();
        assert!(condition.matches("ERROR", "Server", "java: Out Of Memory here"));
        assert!(!condition.matches("ERROR", "server-2", "Out of memory"));
        assert!(!condition.matches("WARN", "server", "Out of memory"));

        let wildcard = Condition::new("", "", "").unwrap();
        assert!(wildcard.matches("anything", "at", "all"));
    }

    #[test]
    fn test_invalid_condition_pattern() {
        assert!(matches!(
            Condition::new("(", "", ""),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_any_condition_makes_event_reportable() {
        let aggregator = AlertAggregator::new(
            "ops",
            vec![
                Condition::new("ERROR", "", "").unwrap(),
                Condition::new("", "database", "deadlock").unwrap(),
            ],
            Duration::ZERO,
            Duration::ZERO,
        );

        assert!(aggregator.reportable("ERROR", "web", "boom"));
        assert!(aggregator.reportable("WARN", "database", "Deadlock detected"));
        assert!(!aggregator.reportable("WARN", "web", "deadlock"));
        assert!(!aggregator.log_received_at("INFO", "web", "ok", at(0)));
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_stale_buffer_discarded_after_interval() {
        let aggregator = errors_only(60);
        aggregator.log_received_at("ERROR", "web", "first", at(0));
        aggregator.log_received_at("ERROR", "web", "second", at(61));

        let batch = aggregator.flush();
        assert_eq!(
            batch.preamble.as_deref(),
            Some("Suppressed events: 1 not shown")
        );
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].message, "second");
    }

    #[test]
    fn test_buffer_kept_within_interval() {
        let aggregator = errors_only(60);
        aggregator.log_received_at("ERROR", "web", "first", at(0));
        aggregator.log_received_at("ERROR", "web", "second", at(59));
        // Exactly one interval later is not stale yet
        aggregator.log_received_at("ERROR", "web", "third", at(119));

        let batch = aggregator.flush();
        assert!(batch.preamble.is_none());
        assert_eq!(batch.events.len(), 3);

        // Discard count resets once reported
        assert!(aggregator.flush().is_empty());
    }

    #[test]
    fn test_huge_interval_never_discards() {
        let aggregator = errors_only(u64::MAX);
        aggregator.log_received_at("ERROR", "web", "a", at(0));
        aggregator.log_received_at("ERROR", "web", "b", at(100_000_000));
        assert_eq!(aggregator.pending(), 2);
        assert!(aggregator.flush().preamble.is_none());
    }

    #[test]
    fn test_run_cycle_sends_one_batch_to_every_alerter() {
        let mut aggregator = errors_only(0);
        for _ in 0..2 {
            let mut alerter = MockAlerter::new();
            alerter.expect_name().return_const("mail".to_string());
            alerter
                .expect_alert()
                .withf(|batch| batch.events.len() == 2 && batch.preamble.is_none())
                .times(1)
                .return_const(());
            aggregator.add_alerter(Arc::new(alerter));
        }

        assert!(!aggregator.run_cycle());
        // Same instant: with a zero interval any later event would find the buffer stale
        aggregator.log_received_at("ERROR", "web", "a", at(0));
        aggregator.log_received_at("ERROR", "db", "b", at(0));
        assert!(aggregator.has_new_events());

        assert!(aggregator.run_cycle());
        assert!(!aggregator.has_new_events());
        assert_eq!(aggregator.pending(), 0);
        assert!(!aggregator.run_cycle());
    }

    #[test]
    fn test_events_during_cooldown_wait_for_next_reportable_event() {
        let aggregator = errors_only(600);
        aggregator.log_received_at("ERROR", "web", "a", at(0));
        aggregator.alert();

        // Arrives during the cooldown; cleared flag means no alert of its own
        aggregator.log_received_at("ERROR", "web", "b", at(10));
        aggregator.lock_buffer().new_events = false;
        assert!(!aggregator.has_new_events());
        assert_eq!(aggregator.pending(), 1);

        aggregator.log_received_at("ERROR", "web", "c", at(20));
        let batch = aggregator.flush();
        let messages: Vec<&str> = batch.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_threaded_loop_delivers() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut alerter = MockAlerter::new();
        alerter.expect_name().return_const("mail".to_string());
        alerter.expect_alert().returning(move |batch| {
            let _ = tx.send(batch.events.len());
        });

        let mut aggregator = AlertAggregator::new(
            "ops",
            vec![Condition::new("", "", "").unwrap()],
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .with_idle_poll(Duration::from_millis(10));
        aggregator.add_alerter(Arc::new(alerter));
        let aggregator = Arc::new(aggregator);

        let handle = aggregator.start().unwrap();
        aggregator.log_received("ERROR", "web", "boom");

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        aggregator.stop();
        handle.join().unwrap();
    }
}
