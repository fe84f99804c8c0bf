use thiserror::Error;

/// Errors that can occur in collectors (file tailing, disk polling)
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Failed to query filesystem: {0}")]
    FilesystemQuery(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while classifying or delivering a reassembled log message
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("malformed entry header: {0}")]
    Parse(String),

    #[error("delivery failed: {0}")]
    Delivery(#[from] AlertError),
}

/// Errors that can occur when sending notifications or alerts
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Failed to send notification: {0}")]
    NotificationFailed(String),

    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
