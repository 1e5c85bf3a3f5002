use std::time::Duration;

/// Whether repeating a command can change the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// What an attempt's failure allows the caller to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Out of attempts, or the error is not retryable
    GiveUp,
    /// The request may have been applied; the caller must not repeat it
    Ambiguous,
}

/// Bounded retry with exponential backoff and jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `attempt` counts failed attempts so far, starting at 0.
    ///
    /// `transient` errors are network failures, timeouts and unavailable
    /// servers; `sent` says whether any byte of the request reached the
    /// socket during the failed attempt.
    pub fn decide(
        &self,
        attempt: u32,
        idempotency: Idempotency,
        transient: bool,
        sent: bool,
    ) -> RetryDecision {
        if !transient {
            return RetryDecision::GiveUp;
        }
        if idempotency == Idempotency::NonIdempotent && sent {
            return RetryDecision::Ambiguous;
        }
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt` capped at
    /// the maximum, plus up to half of that again as jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        (base + Duration::from_millis(fastrand::u64(0..=jitter_ms))).min(self.max_backoff)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
