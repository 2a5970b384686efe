//! Bounded retry with a recovery step between attempts.
//!
//! Used around transport operations: when the broker connection drops,
//! the recovery step reconnects and the action runs again after a
//! backoff. The executor never terminates the process; the caller
//! decides what a final failure means.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::random_range;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;

/// Classifies an error as transient.
///
/// Implemented per error type instead of comparing against sentinel
/// values, so wrapping an error never hides its kind.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Attempt budget and backoff curve.
///
/// `attempts` counts every run of the action, including the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before attempt `attempt + 1`, capped, plus up
    /// to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The action failed with an error that is not worth retrying.
    #[error("non-retryable failure: {0}")]
    Fatal(E),

    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `action` up to `policy.attempts` times.
///
/// After each retryable failure (except the last) `recover` runs once
/// and the executor sleeps for the policy backoff. A recovery failure
/// is logged and does not stop the next attempt.
pub async fn retry<T, E, A, AF, R, RF>(
    policy: &RetryPolicy,
    what: &str,
    mut action: A,
    mut recover: R,
) -> Result<T, RetryError<E>>
where
    E: Retryable + Display,
    A: FnMut() -> AF,
    AF: Future<Output = Result<T, E>>,
    R: FnMut() -> RF,
    RF: Future<Output = Result<(), E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match action().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(RetryError::Fatal(err));
        }

        if attempt >= attempts {
            return Err(RetryError::Exhausted { attempts, last: err });
        }

        let delay = policy.backoff(attempt);
        log::warn!(
            "{what} failed (attempt {attempt}/{attempts}): {err} – recovering, retry in {}ms",
            delay.as_millis()
        );

        if let Err(recover_err) = recover().await {
            log::warn!("{what}: recovery step failed: {recover_err}");
        }

        sleep(delay).await;
        attempt += 1;
    }
}
