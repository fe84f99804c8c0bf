/// Notification sink shared by every reporter and monitor
pub mod notifier;

/// Sliding-window rate limiting
pub mod rate_limiter;

/// Alert batches and email delivery
pub mod email;

pub use email::{AlertBatch, Alerter, EmailAlerter, MailTransport, SmtpRelay};
pub use notifier::{Notifier, QueuedNotifier};
pub use rate_limiter::{Admission, RateLimiter};
