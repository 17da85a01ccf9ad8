//! Retry Policy
//!
//! Exponential backoff with symmetric jitter for the three classes of
//! adapter work: opening the transport, AT initialization, and steady-state
//! requests.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Invalid retry tunables
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryConfigError {
    #[error("{class}: max_attempts must be at least 1")]
    NoAttempts { class: &'static str },

    #[error("{class}: base_delay_ms ({base}) exceeds max_delay_ms ({max})")]
    DelayOrder { class: &'static str, base: u64, max: u64 },

    #[error("{class}: backoff_multiplier must be >= 1.0, got {value}")]
    Multiplier { class: &'static str, value: f64 },

    #[error("{class}: jitter_factor must be within 0.0..=1.0, got {value}")]
    Jitter { class: &'static str, value: f64 },

    #[error("Failed to load retry configuration: {0}")]
    Load(String),
}

/// Tunables for one class of retried work
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the capped delay added or removed at random
    pub jitter_factor: f64,
}

impl RetryPolicyOptions {
    pub const CONNECT: RetryPolicyOptions = RetryPolicyOptions {
        max_attempts: 5,
        base_delay_ms: 1000,
        max_delay_ms: 30_000,
        backoff_multiplier: 2.0,
        jitter_factor: 0.3,
    };

    pub const INIT: RetryPolicyOptions = RetryPolicyOptions {
        max_attempts: 3,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
        backoff_multiplier: 2.0,
        jitter_factor: 0.2,
    };

    pub const OPERATION: RetryPolicyOptions = RetryPolicyOptions {
        max_attempts: 3,
        base_delay_ms: 200,
        max_delay_ms: 5000,
        backoff_multiplier: 1.5,
        jitter_factor: 0.1,
    };

    /// Single attempt, no waiting
    pub const NONE: RetryPolicyOptions = RetryPolicyOptions {
        max_attempts: 1,
        base_delay_ms: 0,
        max_delay_ms: 0,
        backoff_multiplier: 1.0,
        jitter_factor: 0.0,
    };

    /// Check the tunables, naming the policy class in any error
    pub fn validate(&self, class: &'static str) -> Result<(), RetryConfigError> {
        if self.max_attempts == 0 {
            return Err(RetryConfigError::NoAttempts { class });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(RetryConfigError::DelayOrder {
                class,
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(RetryConfigError::Multiplier {
                class,
                value: self.backoff_multiplier,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(RetryConfigError::Jitter {
                class,
                value: self.jitter_factor,
            });
        }
        Ok(())
    }
}

/// Retry tunables per operation class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub connect: RetryPolicyOptions,
    pub init: RetryPolicyOptions,
    pub operation: RetryPolicyOptions,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            connect: RetryPolicyOptions::CONNECT,
            init: RetryPolicyOptions::INIT,
            operation: RetryPolicyOptions::OPERATION,
        }
    }
}

impl RetryPolicyConfig {
    /// Validate every class
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        self.connect.validate("connect")?;
        self.init.validate("init")?;
        self.operation.validate("operation")
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `min(base * multiplier^(attempt-1), max)` with uniform jitter of
/// `±jitter_factor` of that value, kept within `[0, max]`.
pub fn calculate_backoff_delay(attempt: u32, options: &RetryPolicyOptions) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let exponential = options.base_delay_ms as f64 * options.backoff_multiplier.powi(exponent);
    let capped = exponential.min(options.max_delay_ms as f64);

    let jitter_range = capped * options.jitter_factor;
    let jitter = (fastrand::f64() * 2.0 - 1.0) * jitter_range;

    let max = options.max_delay_ms as f64;
    Duration::from_millis((capped + jitter).clamp(0.0, max).round() as u64)
}

/// Run `operation` until it succeeds or `options.max_attempts` is exhausted.
///
/// Attempts are 1-based. Before each retry the policy sleeps for
/// [`calculate_backoff_delay`] of the previous attempt number; there is no
/// sleep after the final failure, whose error is returned as-is.
///
/// `operation` is called with the attempt number once the backoff has
/// elapsed and before the attempt runs, so the synchronous part of the
/// closure is the attempt-start hook. `on_attempt_failed` is the matching
/// hook after a failed attempt.
pub async fn retry_with_policy<T, E, F, Fut, C>(
    options: &RetryPolicyOptions,
    operation: F,
    on_attempt_failed: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(u32, &E),
{
    retry_if(options, operation, |_| true, on_attempt_failed).await
}

/// Like [`retry_with_policy`], but gives up immediately on errors for which
/// `should_retry` returns false.
pub async fn retry_if<T, E, F, Fut, P, C>(
    options: &RetryPolicyOptions,
    mut operation: F,
    should_retry: P,
    mut on_attempt_failed: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    C: FnMut(u32, &E),
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                on_attempt_failed(attempt, &err);
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = calculate_backoff_delay(attempt, options);
                debug!("Retrying in {:?} (attempt {}/{})", delay, attempt + 1, max_attempts);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter(base: u64, max: u64, multiplier: f64) -> RetryPolicyOptions {
        RetryPolicyOptions {
            max_attempts: 5,
            base_delay_ms: base,
            max_delay_ms: max,
            backoff_multiplier: multiplier,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let options = no_jitter(1000, 30_000, 2.0);
        assert_eq!(calculate_backoff_delay(1, &options), Duration::from_millis(1000));
        assert_eq!(calculate_backoff_delay(2, &options), Duration::from_millis(2000));
        assert_eq!(calculate_backoff_delay(3, &options), Duration::from_millis(4000));
        assert_eq!(calculate_backoff_delay(10, &options), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let options = RetryPolicyOptions {
            jitter_factor: 0.3,
            ..no_jitter(1000, 5000, 2.0)
        };
        for _ in 0..2000 {
            let delay = calculate_backoff_delay(10, &options);
            assert!(delay <= Duration::from_millis(5000), "{delay:?}");
            assert!(delay >= Duration::from_millis(3500), "{delay:?}");
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(RetryPolicyConfig::default().validate().is_ok());
        let config = RetryPolicyConfig::default();
        assert_eq!(config.connect.max_attempts, 5);
        assert_eq!(config.init.base_delay_ms, 500);
        assert!((config.operation.backoff_multiplier - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_validation_errors() {
        let mut options = RetryPolicyOptions::OPERATION;
        options.max_attempts = 0;
        assert!(matches!(options.validate("operation"), Err(RetryConfigError::NoAttempts { .. })));

        let mut options = RetryPolicyOptions::OPERATION;
        options.base_delay_ms = 10_000;
        assert!(matches!(options.validate("operation"), Err(RetryConfigError::DelayOrder { .. })));

        let mut options = RetryPolicyOptions::OPERATION;
        options.backoff_multiplier = 0.5;
        assert!(matches!(options.validate("operation"), Err(RetryConfigError::Multiplier { .. })));

        let mut options = RetryPolicyOptions::OPERATION;
        options.jitter_factor = 1.5;
        assert!(matches!(options.validate("operation"), Err(RetryConfigError::Jitter { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let mut failures = Vec::new();
        let options = no_jitter(100, 1000, 2.0);
        let start = Instant::now();

        let result: Result<u32, String> = retry_with_policy(
            &options,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |attempt, _err: &String| failures.push(attempt),
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failures, vec![1, 2]);
        // 100ms after attempt 1, 200ms after attempt 2
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_is_called_at_each_attempt_start() {
        let options = no_jitter(100, 1000, 2.0);
        let start = Instant::now();
        let mut started = Vec::new();
        let mut failed = Vec::new();

        let result: Result<(), String> = retry_with_policy(
            &RetryPolicyOptions {
                max_attempts: 3,
                ..options
            },
            |attempt| {
                started.push((attempt, start.elapsed().as_millis()));
                async move { Err(format!("failure {attempt}")) }
            },
            |attempt, _err: &String| failed.push(attempt),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(failed, vec![1, 2, 3]);
        let attempts: Vec<u32> = started.iter().map(|&(attempt, _)| attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        // Each start follows the backoff of the previous attempt
        assert_eq!(started[0].1, 0);
        assert!((100..110).contains(&started[1].1));
        assert!((300..310).contains(&started[2].1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_without_final_sleep() {
        let options = RetryPolicyOptions {
            max_attempts: 3,
            ..no_jitter(100, 1000, 2.0)
        };
        let start = Instant::now();

        let result: Result<(), String> = retry_with_policy(
            &options,
            |attempt| async move { Err(format!("failure {attempt}")) },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_policy(
            &RetryPolicyOptions::NONE,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            },
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_if(
            &no_jitter(100, 1000, 2.0),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
            |err: &&str| *err != "permanent",
            |_, _| {},
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_backoff_within_jitter_bounds(
            attempt in 1u32..20,
            base in 1u64..5000,
            extra in 0u64..60_000,
            multiplier in 1.0f64..3.0,
            jitter in 0.0f64..=1.0,
        ) {
            let options = RetryPolicyOptions {
                max_attempts: 5,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                backoff_multiplier: multiplier,
                jitter_factor: jitter,
            };
            let capped = (base as f64 * multiplier.powi(attempt as i32 - 1)).min((base + extra) as f64);
            let delay = calculate_backoff_delay(attempt, &options).as_millis() as f64;
            prop_assert!(delay >= (capped * (1.0 - jitter)).floor() - 1.0);
            prop_assert!(delay <= (capped * (1.0 + jitter)).ceil() + 1.0);
            prop_assert!(delay <= (base + extra) as f64);
        }
    }
}
