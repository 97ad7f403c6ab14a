//! Retry budgets with configurable backoff and jitter.
//!
//! Used for transient registry failures while publishing and for transient
//! deployment failures within a single stage.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubles after every failed attempt.
    #[default]
    Exponential,
    /// Grows by `base` after every failed attempt.
    Linear,
    /// Always waits `base`.
    Constant,
}

/// Jitter strategy to spread retries from concurrent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Wait exactly the computed delay.
    None,
    /// Anywhere between zero and the computed delay.
    #[default]
    Full,
    /// At least half the computed delay.
    Equal,
}

/// A retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single wait, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth of the wait between attempts.
    pub backoff_strategy: BackoffStrategy,
    /// Randomisation applied to each wait.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// The default budget: three attempts, exponential backoff from one second.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many calls a stage or registry operation gets in total.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first wait.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Caps every wait.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets how the wait grows.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the randomisation of each wait.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Attempt tracking for one retried operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: usize,
}

impl RetryState {
    /// A fresh state with no attempts made.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that an attempt is about to be made.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns true if no attempts remain.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempts >= config.max_attempts
    }

    /// Returns how long to wait before the next attempt.
    #[must_use]
    pub fn next_delay(&self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        // The first retry waits `base`.
        let step = self.attempts.saturating_sub(1);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => {
                let exponent = u32::try_from(step).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(exponent)).min(max)
            }
            BackoffStrategy::Linear => {
                let factor = u64::try_from(step + 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor).min(max)
            }
            BackoffStrategy::Constant => base.min(max),
        };

        let wait_ms = match (config.jitter_strategy, delay) {
            (JitterStrategy::None, _) | (_, 0) => delay,
            (JitterStrategy::Full, _) => rand::thread_rng().gen_range(0..=delay),
            (JitterStrategy::Equal, _) => {
                let floor = delay / 2;
                floor + rand::thread_rng().gen_range(0..=delay - floor)
            }
        };

        Duration::from_millis(wait_ms)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// The budget is spent.
    GiveUp,
    /// The failure is not retryable.
    NotRetryable,
}

/// Decides what to do after a failed attempt.
#[must_use]
pub fn should_retry(state: &RetryState, config: &RetryConfig, transient: bool) -> RetryDecision {
    if !transient {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(state.next_delay(config))
}

/// Result of [`retry_transient`], with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The final result.
    pub result: Result<T, E>,
    /// Attempts made, including the first.
    pub attempts: usize,
}

/// Runs an operation, retrying failures classified as transient until the
/// budget is spent.
pub async fn retry_transient<T, E, F, Fut, C>(
    config: &RetryConfig,
    key: &str,
    is_transient: C,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut state = RetryState::new();

    loop {
        state.record_attempt();
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: state.attempts,
                }
            }
            Err(e) => match should_retry(&state, config, is_transient(&e)) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        key,
                        attempt = state.attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: state.attempts,
                    };
                }
            },
        }
    }
}
