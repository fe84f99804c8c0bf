//! Builds the monitoring units from configuration and runs them

use crate::aggregator::AlertAggregator;
use crate::alerts::{AlertBatch, Alerter, EmailAlerter, Notifier};
use crate::collectors::DiskSpaceMonitor;
use crate::config::{Config, EmailAlertConfig};
use crate::error::{CollectorError, ConfigError};
use crate::events::AlertEvent;
use crate::reporters::{EventSink, LogReporter};
use chrono::{DateTime, Local, Utc};
use log::{error, info};
use std::sync::Arc;
use std::thread::JoinHandle;

/// First line of the status report
pub const BANNER: &str = "logwarden: adverse reporting of system events";

/// Owns every reporter, disk monitor and aggregator
pub struct Supervisor {
    started: DateTime<Local>,
    notifier: Arc<dyn Notifier>,
    reporters: Vec<LogReporter>,
    monitors: Vec<DiskSpaceMonitor>,
    aggregators: Vec<Arc<AlertAggregator>>,
    aggregator_handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            started: Local::now(),
            notifier,
            reporters: Vec::new(),
            monitors: Vec::new(),
            aggregators: Vec::new(),
            aggregator_handles: Vec::new(),
        }
    }

    /// Build every unit described by `config`
    ///
    /// Aggregators are attached as sinks to every log reporter.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` met while building a unit.
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> Result<Self, ConfigError> {
        let mut supervisor = Self::new(notifier);

        for log in &config.logs {
            let settings = config.reporter_settings(log)?;
            let reporter = LogReporter::new(settings, Arc::clone(&supervisor.notifier))?;
            supervisor.add_reporter(reporter);
        }

        for disk in &config.disk {
            disk.validate()?;
            supervisor.add_monitor(DiskSpaceMonitor::new(
                disk.path.clone(),
                &disk.warn_mb,
                disk.hysteresis_mb,
                disk.delay(),
                Arc::clone(&supervisor.notifier),
            ));
        }

        for alert in &config.email_alerts {
            let mut aggregator = AlertAggregator::new(
                alert.name.clone(),
                alert.compile_conditions()?,
                alert.delay(),
                alert.interval(),
            );
            aggregator.add_alerter(Arc::new(email_alerter(alert)?));
            supervisor.add_aggregator(Arc::new(aggregator));
        }

        Ok(supervisor)
    }

    pub fn add_reporter(&mut self, reporter: LogReporter) {
        self.reporters.push(reporter);
    }

    pub fn add_monitor(&mut self, monitor: DiskSpaceMonitor) {
        self.monitors.push(monitor);
    }

    /// Register an aggregator and subscribe it to every reporter added so far
    pub fn add_aggregator(&mut self, aggregator: Arc<AlertAggregator>) {
        for reporter in &mut self.reporters {
            reporter.add_sink(Arc::clone(&aggregator) as Arc<dyn EventSink>);
        }
        self.aggregators.push(aggregator);
    }

    pub fn reporters(&self) -> &[LogReporter] {
        &self.reporters
    }

    pub fn monitors(&self) -> &[DiskSpaceMonitor] {
        &self.monitors
    }

    pub fn aggregators(&self) -> &[Arc<AlertAggregator>] {
        &self.aggregators
    }

    /// Start one thread per unit
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::IoError` if a thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        for reporter in &mut self.reporters {
            reporter.start()?;
        }
        for monitor in &mut self.monitors {
            monitor.start()?;
        }
        for aggregator in &self.aggregators {
            self.aggregator_handles.push(aggregator.start()?);
        }

        info!(
            "Monitoring {} logs and {} filesystems with {} alert aggregators",
            self.reporters.len(),
            self.monitors.len(),
            self.aggregators.len()
        );
        Ok(())
    }

    /// Stop every unit; aggregator threads finish their current cycle on their own
    pub fn stop(&mut self) {
        for reporter in &mut self.reporters {
            reporter.stop();
        }
        for monitor in &mut self.monitors {
            monitor.stop();
        }
        for aggregator in &self.aggregators {
            aggregator.stop();
        }
        self.aggregator_handles.clear();
    }

    /// Banner, start time and one line per reporter and monitor
    pub fn status(&self) -> String {
        let mut report = format!(
            "{}\n\nMonitoring started: {}\n",
            BANNER,
            self.started.format("%Y-%m-%d %H:%M:%S")
        );
        for reporter in &self.reporters {
            report.push_str(&reporter.status());
            report.push('\n');
        }
        for monitor in &self.monitors {
            report.push_str(&monitor.status());
            report.push('\n');
        }
        report
    }
}

fn email_alerter(alert: &EmailAlertConfig) -> Result<EmailAlerter, ConfigError> {
    Ok(EmailAlerter::new(
        alert.name.clone(),
        alert.email_subject.clone(),
        Box::new(alert.relay()?),
    ))
}

/// The synthetic batch sent by `--email-test`
pub fn test_batch() -> AlertBatch {
    let now = Utc::now();
    AlertBatch {
        preamble: None,
        events: vec![AlertEvent {
            level: "Email alert test".to_string(),
            name: "test".to_string(),
            message: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            received: now,
        }],
    }
}

/// Send the test batch through every configured email alerter
///
/// Returns the number of alerters exercised. Delivery failures are logged by
/// the alerters themselves.
///
/// # Errors
///
/// Returns a `ConfigError` if an email section cannot be turned into an alerter.
pub fn email_test(config: &Config) -> Result<usize, ConfigError> {
    if config.email_alerts.is_empty() {
        error!("No [[email_alerts]] sections configured");
    }

    let batch = test_batch();
    for alert in &config.email_alerts {
        info!("Sending test alert via {}", alert.name);
        email_alerter(alert)?.alert(&batch);
    }
    Ok(config.email_alerts.len())
}
