use crate::aggregator::Condition;
use crate::alerts::SmtpRelay;
use crate::error::ConfigError;
use crate::reporters::log_reporter::{ReporterSettings, DEFAULT_MAX_LOG_LENGTH};
use crate::reporters::LogFormat;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub logs: Vec<LogConfig>,
    #[serde(default)]
    pub disk: Vec<DiskConfig>,
    #[serde(default)]
    pub email_alerts: Vec<EmailAlertConfig>,
}

/// Settings inherited by every `[[logs]]` entry that does not set them
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub levels: Option<Vec<String>>,
    pub rate_limit_n: Option<usize>,
    pub rate_limit_t: Option<f64>,
    pub max_log_length: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_kind")]
    pub kind: LogFormat,
    pub name: String,
    pub file: PathBuf,
    pub levels: Option<Vec<String>>,
    pub start_pattern: Option<String>,
    pub rate_limit_n: Option<usize>,
    pub rate_limit_t: Option<f64>,
    pub max_log_length: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub path: PathBuf,
    #[serde(default = "default_warn_mb")]
    pub warn_mb: Vec<u64>,
    #[serde(default = "default_hysteresis_mb")]
    pub hysteresis_mb: u64,
    #[serde(default = "default_disk_delay")]
    pub delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailAlertConfig {
    pub name: String,
    /// `[level, name, message]` patterns; empty strings match anything
    pub conditions: Vec<[String; 3]>,
    /// Seconds to wait for related events before alerting
    pub delay: u64,
    /// Minimum seconds between alerts
    pub interval: u64,
    /// `host` or `host:port`
    pub smtp: String,
    pub email_from: String,
    pub email_to: Vec<String>,
    pub email_subject: String,
}

fn default_kind() -> LogFormat {
    LogFormat::Default
}

fn default_warn_mb() -> Vec<u64> {
    vec![2048, 1024]
}

fn default_hysteresis_mb() -> u64 {
    512
}

fn default_disk_delay() -> u64 {
    60
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const MAX_RATE_LIMIT_T_SECS: f64 = 365.0 * 24.0 * 3600.0;

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, and the
    /// errors of [`Config::parse`] otherwise.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::TomlError` for malformed TOML or unknown keys, and
    /// `ConfigError::ValidationError`/`InvalidPattern` for invalid values.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        debug!(
            "Loaded {} log, {} disk and {} alert sections",
            config.logs.len(),
            config.disk.len(),
            config.email_alerts.len()
        );
        Ok(config)
    }

    /// Check every section, building each component's settings once
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logs.is_empty() && self.disk.is_empty() {
            return Err(ConfigError::ValidationError(
                "nothing to monitor: add a [[logs]] or [[disk]] section".to_string(),
            ));
        }

        for log in &self.logs {
            self.reporter_settings(log)?;
        }
        for disk in &self.disk {
            disk.validate()?;
        }
        for alert in &self.email_alerts {
            alert.compile_conditions()?;
            alert.relay()?;
        }
        Ok(())
    }

    /// Resolve a `[[logs]]` entry against `[defaults]`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for missing or inconsistent values
    /// and `ConfigError::InvalidPattern` for a bad `start_pattern`.
    pub fn reporter_settings(&self, log: &LogConfig) -> Result<ReporterSettings, ConfigError> {
        let invalid =
            |msg: &str| ConfigError::ValidationError(format!("[logs] {}: {}", log.name, msg));

        if log.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "[logs] entry without a name".to_string(),
            ));
        }
        if log.file.as_os_str().is_empty() {
            return Err(invalid("file must not be empty"));
        }

        let mut settings = ReporterSettings::new(log.name.clone(), log.file.clone(), log.kind);

        if log.kind.uses_levels() {
            let levels = log
                .levels
                .as_ref()
                .or(self.defaults.levels.as_ref())
                .filter(|levels| !levels.is_empty())
                .ok_or_else(|| invalid("levels must be set here or in [defaults]"))?;
            settings = settings.with_levels(levels.as_slice());
        }

        if let Some(pattern) = &log.start_pattern {
            if !log.kind.uses_levels() {
                return Err(invalid("start_pattern is not used by kind \"all\""));
            }
            let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            let has_level = regex.capture_names().flatten().any(|n| n == "level");
            if log.kind == LogFormat::Default && !has_level {
                return Err(invalid("start_pattern needs a (?P<level>...) group"));
            }
            settings = settings.with_start_pattern(regex);
        }

        let rate_n = log.rate_limit_n.or(self.defaults.rate_limit_n);
        let rate_t = log.rate_limit_t.or(self.defaults.rate_limit_t);
        match (rate_n, rate_t) {
            (Some(0), _) => return Err(invalid("rate_limit_n must be positive")),
            (_, Some(t)) if !t.is_finite() || t <= 0.0 => {
                return Err(invalid("rate_limit_t must be positive"))
            }
            (_, Some(t)) if t > MAX_RATE_LIMIT_T_SECS => {
                return Err(invalid("rate_limit_t must not exceed one year"))
            }
            (Some(n), Some(t)) => settings = settings.with_rate_limit(n, t),
            (None, None) => {}
            _ => return Err(invalid("rate_limit_n and rate_limit_t must be set together")),
        }

        let max_log_length = log
            .max_log_length
            .or(self.defaults.max_log_length)
            .unwrap_or(DEFAULT_MAX_LOG_LENGTH);
        if max_log_length < 4 {
            return Err(invalid("max_log_length must be at least 4"));
        }
        settings = settings.with_max_log_length(max_log_length);

        let poll_ms = log
            .poll_interval_ms
            .or(self.defaults.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        Ok(settings.with_poll_interval(Duration::from_millis(poll_ms)))
    }
}

impl DiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| {
            ConfigError::ValidationError(format!("[disk] {}: {}", self.path.display(), msg))
        };

        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "[disk] path must not be empty".to_string(),
            ));
        }
        if self.warn_mb.is_empty() {
            return Err(invalid("warn_mb needs at least one threshold"));
        }
        if self.delay_seconds == 0 {
            return Err(invalid("delay_seconds must be positive"));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }
}

impl EmailAlertConfig {
    pub fn compile_conditions(&self) -> Result<Vec<Condition>, ConfigError> {
        if self.conditions.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "[email_alerts] {}: at least one condition is required",
                self.name
            )));
        }
        self.conditions
            .iter()
            .map(|[level, name, message]| Condition::new(level, name, message))
            .collect()
    }

    pub fn relay(&self) -> Result<SmtpRelay, ConfigError> {
        SmtpRelay::new(&self.smtp, &self.email_from, &self.email_to)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
