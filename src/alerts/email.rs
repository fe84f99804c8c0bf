use crate::error::{AlertError, ConfigError};
use crate::events::AlertEvent;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, error, info};
use std::thread;
use std::time::Duration;

/// Attempts made to deliver one batch before it is dropped
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Pause between delivery attempts
pub const SEND_RETRY_DELAY: Duration = Duration::from_secs(10);

/// A flushed group of alert events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertBatch {
    /// Summary placed ahead of the events (e.g. how many were discarded)
    pub preamble: Option<String>,
    pub events: Vec<AlertEvent>,
}

impl AlertBatch {
    pub fn is_empty(&self) -> bool {
        self.preamble.is_none() && self.events.is_empty()
    }

    /// Render the batch as plain text
    pub fn format(&self) -> String {
        let formatted = self
            .events
            .iter()
            .map(AlertEvent::format)
            .collect::<Vec<_>>()
            .join("\n");

        match &self.preamble {
            Some(preamble) => format!("{}\n\n{}", preamble, formatted),
            None => formatted,
        }
    }
}

/// Delivers alert batches somewhere (email, pager, ...)
#[cfg_attr(test, mockall::automock)]
pub trait Alerter: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a batch. Failures are handled (and logged) by the alerter itself.
    fn alert(&self, batch: &AlertBatch);
}

/// Low-level mail submission
#[cfg_attr(test, mockall::automock)]
pub trait MailTransport: Send + Sync {
    fn send(&self, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Plain SMTP relay submission
pub struct SmtpRelay {
    host: String,
    port: u16,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpRelay {
    /// Default SMTP port used when the relay address has none
    pub const DEFAULT_PORT: u16 = 25;

    /// Create a relay from `host[:port]` and the envelope addresses
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid port, an
    /// unparsable address, or an empty recipient list.
    pub fn new(smtp: &str, from: &str, to: &[String]) -> Result<Self, ConfigError> {
        let (host, port) = match smtp.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::ValidationError(format!("invalid SMTP port in '{}'", smtp))
                })?;
                (host.to_string(), port)
            }
            None => (smtp.to_string(), Self::DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(ConfigError::ValidationError(
                "SMTP host must not be empty".to_string(),
            ));
        }
        if to.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one email recipient is required".to_string(),
            ));
        }

        let parse = |addr: &str| {
            addr.parse::<Mailbox>().map_err(|e| {
                ConfigError::ValidationError(format!("invalid email address '{}': {}", addr, e))
            })
        };

        Ok(Self {
            host,
            port,
            from: parse(from)?,
            to: to.iter().map(|addr| parse(addr)).collect::<Result<_, _>>()?,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl MailTransport for SmtpRelay {
    fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| AlertError::NotificationFailed(format!("invalid email: {}", e)))?;

        let mailer = SmtpTransport::builder_dangerous(&self.host)
            .port(self.port)
            .build();

        debug!("Sending email via {}:{}", self.host, self.port);
        mailer
            .send(&email)
            .map(|_| ())
            .map_err(|e| AlertError::NotificationFailed(format!("SMTP delivery failed: {}", e)))
    }
}

/// Sends alert batches as email, retrying a bounded number of times
pub struct EmailAlerter {
    name: String,
    subject: String,
    transport: Box<dyn MailTransport>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl EmailAlerter {
    pub fn new(name: String, subject: String, transport: Box<dyn MailTransport>) -> Self {
        Self {
            name,
            subject,
            transport,
            max_attempts: MAX_SEND_ATTEMPTS,
            retry_delay: SEND_RETRY_DELAY,
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Build the email body for a batch
    pub fn format_body(batch: &AlertBatch) -> String {
        let preamble = format!(
            "Alert created: {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );
        format!("{}\n\n{}", preamble, batch.format())
    }

    /// Try to send `body`, returning the number of attempts on success
    ///
    /// # Errors
    ///
    /// Returns the last transport error once every attempt has failed.
    pub fn send_with_retry(&self, body: &str) -> Result<u32, AlertError> {
        let mut attempt = 1;
        loop {
            match self.transport.send(&self.subject, body) {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    error!(
                        "{}: failed to send email on attempt {}: {}",
                        self.name, attempt, e
                    );
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Alerter for EmailAlerter {
    fn name(&self) -> &str {
        &self.name
    }

    fn alert(&self, batch: &AlertBatch) {
        let body = Self::format_body(batch);
        match self.send_with_retry(&body) {
            Ok(attempts) => info!(
                "{}: sent alert with {} events (attempt {})",
                self.name,
                batch.events.len(),
                attempts
            ),
            Err(_) => error!(
                "{}: failed to send email after {} attempts, dropping {} events",
                self.name,
                self.max_attempts,
                batch.events.len()
            ),
        }
    }
}
