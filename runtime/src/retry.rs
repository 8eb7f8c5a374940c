//! Bounded retry with fixed or exponential backoff.
//!
//! Used for transient failures at process boundaries: connecting to the broker at startup
//! and re-running a failed handler before a delivery is dead-lettered.
//!
//! # Example
//!
//! ```rust
//! use shopwire_runtime::retry::{RetryPolicy, retry};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let value = retry(&policy, |_attempt| async { Ok::<_, String>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry policy.
///
/// `max_attempts` counts every call including the first, so a policy of 5 attempts makes
/// at most 4 retries.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap for exponential backoff
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Randomize each delay to between half and all of its value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that waits the same `interval` between every attempt.
    #[must_use]
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after `failures` consecutive failures (1-based).
    ///
    /// `initial_delay * multiplier^(failures - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        let capped = if delay_ms.is_finite() { delay_ms.min(max_ms) } else { max_ms };

        let delay = Duration::from_millis(capped as u64);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set total attempts, including the first. Values below 1 are raised to 1.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Every attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempts: {last_error}")]
pub struct Exhausted<E> {
    /// Attempts made
    pub attempts: u32,
    /// Error from the final attempt
    pub last_error: E,
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// The operation receives the 1-based attempt number. No delay follows the final
/// attempt.
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the last error once every attempt has failed.
///
/// # Example
///
/// ```rust
/// use shopwire_runtime::retry::{RetryPolicy, retry};
/// use std::time::Duration;
///
/// # async fn example() {
/// let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
/// let result = retry(&policy, |attempt| async move {
///     Err::<(), _>(format!("attempt {attempt} failed"))
/// })
/// .await;
///
/// let exhausted = result.unwrap_err();
/// assert_eq!(exhausted.attempts, 2);
/// assert_eq!(exhausted.last_error, "attempt 2 failed");
/// # }
/// ```
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
