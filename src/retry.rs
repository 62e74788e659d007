//! Retry utilities with exponential or constant backoff.
//!
//! Two policies are used in the operator: the bounded exponential backoff
//! applied to failed reconciles (1s doubling to 15s) and the constant 1s poll,
//! capped at five retries, that waits for a token secret to be populated.
//!
//! # Example
//!
//! ```ignore
//! use istio_operator::retry::{retry_with_backoff, RetryConfig};
//!
//! let secret = retry_with_backoff(
//!     &RetryConfig::token_wait(),
//!     "read_token_secret",
//!     || async { read_token_data(&target, "istio-system", &name).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = constant)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x, never above `max_delay`
    pub jitter: bool,
}

impl RetryConfig {
    /// Backoff for failed reconciles: 1s doubling up to 15s, forever.
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Poll for token secret contents: one read plus five retries, 1s apart.
    pub fn token_wait() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Iterator over the delays this config produces.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            next: self.initial_delay,
        }
    }
}

/// Stateful delay sequence for a [`RetryConfig`].
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
}

impl Backoff {
    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = Duration::from_secs_f64(
            (base.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        if !self.config.jitter {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(
            (base.as_secs_f64() * jitter).min(self.config.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with backoff.
///
/// Retries until success, or until `max_attempts` is reached when it is set.
///
/// # Returns
/// The result of the operation, or the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut backoff = config.backoff();

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
