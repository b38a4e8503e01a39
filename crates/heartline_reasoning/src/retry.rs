//! Exponential backoff for LLM calls.
//!
//! `with_retry` retries transient HTTP statuses (429, 408, 5xx) and network
//! errors. Client errors (400, 401, 403, 404) fail immediately.

use anyhow::Result;
use heartline_core::config::DialogueConfig;
use rand::Rng;
use reqwest::{Response, StatusCode};
use std::future::Future;
use std::time::Duration;

const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            backoff_factor: 2.0,
        }
    }
}

impl From<&DialogueConfig> for RetryConfig {
    fn from(cfg: &DialogueConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// `base_delay` plus up to 250ms of random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Execute an HTTP operation until it succeeds, fails permanently, or
/// `max_attempts` is exhausted.
pub async fn with_retry<F, Fut>(config: &RetryConfig, provider_name: &str, operation: F) -> Result<Response>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(response) if response.status().is_success() => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", provider_name, attempt);
                }
                return Ok(response);
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let snippet: String = body.chars().take(200).collect();
                if !is_retryable_status(status) {
                    anyhow::bail!("{} API error ({}): {}", provider_name, status, snippet);
                }
                tracing::warn!(
                    "{} returned {} on attempt {}/{}: {}",
                    provider_name,
                    status,
                    attempt,
                    config.max_attempts,
                    snippet
                );
                last_error = Some(format!("{} ({})", provider_name, status));
            }
            Err(e) => {
                // Timeout, DNS failure, connection refused
                tracing::warn!(
                    "{} network error on attempt {}/{}: {}",
                    provider_name,
                    attempt,
                    config.max_attempts,
                    e
                );
                last_error = Some(format!("{}: {}", provider_name, e));
            }
        }

        if attempt < config.max_attempts {
            let sleep_time = config.delay_for(attempt);
            tracing::debug!(
                "{} retrying in {:.2}s (attempt {}/{})",
                provider_name,
                sleep_time.as_secs_f64(),
                attempt + 1,
                config.max_attempts
            );
            tokio::time::sleep(sleep_time).await;
        }
    }

    anyhow::bail!(
        "All {} attempts exhausted. Last error: {}",
        config.max_attempts,
        last_error.unwrap_or_else(|| "unknown".to_string())
    )
}
