//! Bounded retries for operations against the remote UI.

use chatrelay_core::{ApiError, Error};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Pause after the failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(attempt.max(1)),
            Backoff::Exponential => self
                .delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        }
    }
}

/// Run `op` until it succeeds, at most `policy.retries` times.
///
/// `op` receives the 1-based attempt number. Errors that retrying in place
/// cannot fix (a closed session, bad configuration) end the loop at once.
/// The final error keeps the code and status of the last failure and embeds
/// its reason in the message.
pub async fn retry_until_success<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = policy.retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() || attempt >= attempts => {
                return Err(exhausted(label, attempt, e));
            }
            Err(e) => {
                warn!(label, attempt, max = attempts, error = %e, "Attempt failed");
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}

fn exhausted(label: &str, attempts: u32, err: Error) -> ApiError {
    let last = ApiError::from(err);
    ApiError {
        message: format!(
            "[{}] failed after {} attempt(s): {}",
            label, attempts, last.message
        ),
        ..last
    }
}
