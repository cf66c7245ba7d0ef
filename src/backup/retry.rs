use super::job::JobControl;
use super::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Retry settings of a policy or subsystem.
///
/// `max_retries` bounds the total number of attempts, so a job whose first
/// three writes fail with `max_retries = 3` is marked failed after the third.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: BackoffStrategy,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_retries.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.settings.initial_delay_ms as f64;
        let base_ms = match self.settings.strategy {
            BackoffStrategy::Linear => initial * attempt.max(1) as f64,
            BackoffStrategy::Exponential => initial * 2f64.powi(attempt.saturating_sub(1) as i32),
        };

        let mut delay_ms = base_ms;
        if self.settings.jitter {
            delay_ms += base_ms * 0.1 * rand::random::<f64>();
        }

        Duration::from_millis(delay_ms.min(self.settings.max_delay_ms as f64) as u64)
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Retry succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) if attempt >= self.max_attempts() => {
                    warn!("All {} retry attempts exhausted", self.max_attempts());
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) but backoff sleeps end early on cancellation.
    pub async fn execute_cancellable<F, Fut, T>(&self, control: &JobControl, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f(attempt).await {
                Ok(result) => return Ok(result),
                Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                Err(error) if !error.is_retryable() || attempt >= self.max_attempts() => {
                    return Err(error)
                }
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        error = %error,
                        "Attempt failed, retrying in {:?}",
                        delay
                    );
                    control.sleep(delay).await?;
                }
            }
        }
    }
}
