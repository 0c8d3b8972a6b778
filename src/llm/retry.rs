use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ExecutionError, FailureKind};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    multiplier: f64,
    max_backoff: Option<Duration>,
    retryable: HashSet<FailureKind>,
    honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
            max_backoff: None,
            retryable: default_retryable(),
            honor_retry_after: false,
        }
    }
}

fn default_retryable() -> HashSet<FailureKind> {
    [
        FailureKind::Transport,
        FailureKind::RateLimited,
        FailureKind::ServerError,
    ]
    .into_iter()
    .collect()
}

impl RetryPolicy {
    /// Policy with the default retryable set, no backoff cap and
    /// `Retry-After` hints ignored.
    pub fn new(max_attempts: u32, base_backoff: Duration, multiplier: f64) -> Result<Self, ExecutionError> {
        let policy = Self {
            max_attempts,
            base_backoff,
            multiplier,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that sends exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn with_honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.max_attempts < 1 {
            return Err(ExecutionError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(ExecutionError::InvalidRequest(format!(
                "backoff multiplier must be a positive number, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Cancellation and local validation failures never retry, whatever the
    /// configured set says.
    pub fn is_retryable(&self, error: &ExecutionError) -> bool {
        match error.kind() {
            FailureKind::Cancelled | FailureKind::InvalidRequest => false,
            kind => self.retryable.contains(&kind),
        }
    }

    /// `base_backoff * multiplier^(attempt-1)`, capped at `max_backoff` when
    /// one is set. `attempt` is the 1-based number of the attempt that just
    /// failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let delay = if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            Duration::from_nanos(u64::MAX)
        } else {
            Duration::from_nanos(nanos.round() as u64)
        };
        self.cap(delay)
    }

    /// Delay before the next attempt after `error` ended attempt `attempt`.
    pub fn delay_for(&self, attempt: u32, error: &ExecutionError) -> Duration {
        match error.retry_after() {
            Some(hint) if self.honor_retry_after => self.cap(hint),
            _ => self.backoff(attempt),
        }
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_backoff {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
