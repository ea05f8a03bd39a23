//! Rate limiting for prompt submissions and model calls.
//!
//! [`RateLimiter`] caps submissions over a rolling window (30 per minute by
//! default). [`CallPacer`] spaces out expensive model calls such as image
//! generation so they never fire closer together than a minimum interval.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limiting error.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// Rate limit exceeded; must wait before submitting.
    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    Exceeded {
        /// Seconds to wait before retry.
        retry_after_secs: u64,
    },
}

/// Rolling-window rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum requests allowed inside one window.
    max_requests: usize,
    /// Length of the rolling window.
    period: Duration,
    /// Timestamps of accepted requests, oldest first.
    window: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per `period`.
    #[must_use]
    pub fn new(max_requests: usize, period: Duration) -> Self {
        Self {
            max_requests,
            period,
            window: VecDeque::new(),
        }
    }

    /// Try to admit one request now.
    pub fn try_acquire(&mut self) -> Result<(), RateLimitError> {
        self.try_acquire_at(Instant::now())
    }

    /// Try to admit one request at `now`.
    ///
    /// On success the timestamp is recorded. On failure nothing is recorded,
    /// so a rejected request never extends the caller's wait.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), RateLimitError> {
        self.prune(now);

        if self.window.len() >= self.max_requests {
            let retry_after_secs = match self.window.front() {
                Some(&oldest) => {
                    let age = now.saturating_duration_since(oldest);
                    self.period.saturating_sub(age).as_secs().saturating_add(1)
                }
                None => self.period.as_secs().max(1),
            };
            return Err(RateLimitError::Exceeded { retry_after_secs });
        }

        self.window.push_back(now);
        Ok(())
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&first) = self.window.front() {
            if now.saturating_duration_since(first) >= self.period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Spaces calls so consecutive ones start at least `min_interval` apart.
///
/// Callers queue on an async mutex, so calls are served in arrival order.
#[derive(Debug)]
pub struct CallPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl CallPacer {
    /// Create a pacer with the given minimum spacing.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller's slot opens, then reserve the next one.
    pub async fn wait_turn(&self) {
        let mut slot = self.next_slot.lock().await;
        if let Some(at) = *slot
            && at > Instant::now()
        {
            tokio::time::sleep_until(at).await;
        }
        *slot = Some(Instant::now() + self.min_interval);
    }
}
