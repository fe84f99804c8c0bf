use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Outcome of offering one message to a [`RateLimiter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Deliver the message; `suppressed_before` messages were held back since the last delivery
    Deliver { suppressed_before: u64 },
    /// Drop the message; `first` is set for the first suppression of a limiting episode
    Suppressed { first: bool },
}

/// Sliding-window rate limiter
///
/// Admits at most `limit_n` messages per trailing `limit_t` window. Messages
/// beyond the limit are counted rather than recorded, so the window itself
/// never holds more than `limit_n` timestamps.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum number of deliveries per window
    limit_n: usize,
    /// Window length
    limit_t: Duration,
    /// Timestamps of recent deliveries, oldest first
    recent: VecDeque<DateTime<Utc>>,
    /// Messages suppressed since the last delivery
    suppressed_count: u64,
    /// Messages suppressed over the limiter's lifetime
    suppressed_total: u64,
    /// Whether the "rate limiting active" notice has been raised for the current episode
    limiting: bool,
}

impl RateLimiter {
    /// Create a limiter allowing `limit_n` messages per `limit_t`
    ///
    /// # Arguments
    ///
    /// * `limit_n` - Maximum number of deliveries per window
    /// * `limit_t` - Length of the sliding window
    pub fn new(limit_n: usize, limit_t: Duration) -> Self {
        Self {
            limit_n,
            limit_t,
            recent: VecDeque::with_capacity(limit_n),
            suppressed_count: 0,
            suppressed_total: 0,
            limiting: false,
        }
    }

    /// Create a limiter from a window length in (possibly fractional) seconds
    ///
    /// Windows too long to represent are clamped to the largest `Duration`.
    pub fn with_window_secs(limit_n: usize, limit_t_secs: f64) -> Self {
        let millis = (limit_t_secs * 1000.0).round();
        let max_millis = Duration::MAX.num_milliseconds() as f64;
        let limit_t = if millis.is_finite() && millis.abs() < max_millis {
            Duration::milliseconds(millis as i64)
        } else {
            Duration::MAX
        };
        Self::new(limit_n, limit_t)
    }

    /// Offer a message now
    pub fn admit(&mut self) -> Admission {
        self.admit_at(Utc::now())
    }

    /// Offer a message at a specific time
    ///
    /// This is primarily used for testing with controlled timestamps.
    pub fn admit_at(&mut self, now: DateTime<Utc>) -> Admission {
        self.expire(now);

        if self.recent.len() < self.limit_n {
            self.recent.push_back(now);
            let suppressed_before = self.suppressed_count;
            self.suppressed_count = 0;
            self.limiting = false;
            Admission::Deliver { suppressed_before }
        } else {
            self.suppressed_count += 1;
            self.suppressed_total += 1;
            let first = !self.limiting;
            self.limiting = true;
            Admission::Suppressed { first }
        }
    }

    /// Deliveries recorded in the window ending at `now`
    pub fn current_count_at(&mut self, now: DateTime<Utc>) -> usize {
        self.expire(now);
        self.recent.len()
    }

    /// Messages suppressed since the last delivery
    pub fn pending_suppressed(&self) -> u64 {
        self.suppressed_count
    }

    /// Messages suppressed over the limiter's lifetime
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }

    pub fn limit_n(&self) -> usize {
        self.limit_n
    }

    pub fn limit_t(&self) -> Duration {
        self.limit_t
    }

    /// Drop deliveries whose age has reached the window length
    fn expire(&mut self, now: DateTime<Utc>) {
        // A window reaching before the representable range never expires anything
        let Some(cutoff) = now.checked_sub_signed(self.limit_t) else {
            return;
        };

        // Deliveries are recorded in order, so only the front can be stale
        while let Some(&time) = self.recent.front() {
            if time <= cutoff {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}
