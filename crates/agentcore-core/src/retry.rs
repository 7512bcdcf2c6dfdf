// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry/backoff for transient provider errors (C10, §4.5).
//!
//! A provider call that fails transiently (network error, 5xx, or a 429
//! whose server-requested delay is within [`RetryConfig::max_retry_delay`])
//! is retried with exponential backoff. A 429 asking for a longer delay is
//! not retried here — it is surfaced so a higher layer can make a
//! user-visible decision.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random jitter applied to each computed delay, as a fraction (0.0–1.0).
    pub jitter_factor: f64,
    /// Cap on a server-requested retry-after delay. A 429 asking for more
    /// than this is surfaced instead of retried.
    pub max_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Exponential backoff with jitter for `attempt` (0-based).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponential = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// What one attempt of a retryable operation yielded.
pub enum Attempt<T> {
    /// Final success.
    Done(T),
    /// Failed, but worth retrying. `retry_after` carries a server-requested
    /// delay (e.g. a 429's `Retry-After` header) when one was present.
    Retry {
        error: anyhow::Error,
        retry_after: Option<Duration>,
    },
    /// Failed in a way retrying cannot fix (auth failure, 4xx, content
    /// policy refusal, …). Returned to the caller immediately.
    Fatal(anyhow::Error),
}

/// Drive `operation` until it returns [`Attempt::Done`] or [`Attempt::Fatal`],
/// or until `config.max_attempts` is exhausted.
///
/// A `Retry` whose `retry_after` exceeds `config.max_retry_delay` is treated
/// like `Fatal` — it is surfaced on the spot rather than slept through.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(error) => return Err(error),
            Attempt::Retry { error, retry_after } => {
                if let Some(delay) = retry_after {
                    if delay > config.max_retry_delay {
                        return Err(error.context(format!(
                            "server requested a {delay:?} retry delay, exceeding the configured cap of {:?}",
                            config.max_retry_delay
                        )));
                    }
                }

                last_error = Some(error);

                if attempt + 1 < config.max_attempts {
                    let delay = retry_after.unwrap_or_else(|| config.calculate_delay(attempt));
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retry failed with no error")))
}

/// Heuristically classify a terminal provider error message as transient.
///
/// Used when a provider adapter surfaces only a human-readable error string
/// (no structured status code) — network failures, 5xx, and 429 all read as
/// transient; everything else (auth, 4xx validation, content-policy
/// refusals) is terminal.
pub fn is_transient_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    const MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "network error",
        "502",
        "503",
        "504",
        "500 internal",
        "429",
        "too many requests",
    ];
    MARKERS.iter().any(|marker| m.contains(marker))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn retry_config_builder_sets_all_fields() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(20))
            .with_backoff_multiplier(1.5)
            .with_jitter_factor(0.2)
            .with_max_retry_delay(Duration::from_secs(45));

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(20));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.jitter_factor, 0.2);
        assert_eq!(config.max_retry_delay, Duration::from_secs(45));
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let config = RetryConfig::new().with_jitter_factor(5.0);
        assert_eq!(config.jitter_factor, 1.0);
    }

    #[test]
    fn calculate_delay_grows_exponentially() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter_factor(0.0);

        let d0 = config.calculate_delay(0);
        let d1 = config.calculate_delay(1);
        let d2 = config.calculate_delay(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn calculate_delay_is_capped() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter_factor(0.0);

        assert_eq!(config.calculate_delay(5), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let config = RetryConfig::new().with_max_attempts(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result = retry_with_backoff(&config, move |_attempt| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Done(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result = retry_with_backoff(&config, move |_attempt| {
            let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Attempt::Retry {
                        error: anyhow::anyhow!("503 service unavailable"),
                        retry_after: None,
                    }
                } else {
                    Attempt::Done("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let config = RetryConfig::new()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result: anyhow::Result<()> = retry_with_backoff(&config, move |_attempt| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Retry { error: anyhow::anyhow!("timeout"), retry_after: None } }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let config = RetryConfig::new().with_max_attempts(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result: anyhow::Result<()> = retry_with_backoff(&config, move |_attempt| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Fatal(anyhow::anyhow!("401 unauthorized")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_beyond_cap_is_surfaced_not_retried() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_max_retry_delay(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result: anyhow::Result<()> = retry_with_backoff(&config, move |_attempt| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Retry {
                    error: anyhow::anyhow!("429 too many requests"),
                    retry_after: Some(Duration::from_secs(120)),
                }
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_within_cap_is_honored_as_the_sleep_duration() {
        let config = RetryConfig::new()
            .with_max_attempts(2)
            .with_max_retry_delay(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result = retry_with_backoff(&config, move |_attempt| {
            let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Attempt::Retry {
                        error: anyhow::anyhow!("429"),
                        retry_after: Some(Duration::from_millis(1)),
                    }
                } else {
                    Attempt::Done(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn is_transient_message_detects_common_markers() {
        assert!(is_transient_message("connection timed out"));
        assert!(is_transient_message("503 Service Unavailable"));
        assert!(is_transient_message("429 Too Many Requests"));
        assert!(!is_transient_message("401 unauthorized"));
        assert!(!is_transient_message("invalid request: missing field 'model'"));
    }
}
