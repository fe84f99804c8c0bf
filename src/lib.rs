/// Error types for every layer of the pipeline
pub mod error;

/// Data flowing between pipeline stages
pub mod events;

/// File tailing, entry reassembly and disk space polling
pub mod collectors;

/// Log reporters
pub mod reporters;

/// Alert aggregation
pub mod aggregator;

/// Notification, rate limiting and email delivery
pub mod alerts;

/// Configuration management
pub mod config;

/// Wiring and status reporting
pub mod supervisor;

// Re-export commonly used types
pub use error::{AlertError, CollectorError, ConfigError, ReportError};
pub use supervisor::Supervisor;
