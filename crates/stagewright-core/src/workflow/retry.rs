//! Retry handler with exponential backoff.
//!
//! Stateless: all decisions are associated functions over `RetryConfig`.
//! `invoke` runs one unit of work (a whole step or one batch) through the
//! connector, applying the per-unit timeout and retrying retryable failures.

use std::time::Duration;

use serde_json::Value;
use stagewright_types::workflow::RetryConfig;
use tokio_util::sync::CancellationToken;

use crate::connector::{BoxConnector, ConnectorError, ConnectorOutput};

/// Result of running one unit through the retry loop.
#[derive(Debug)]
pub struct Invocation {
    pub result: Result<ConnectorOutput, ConnectorError>,
    /// Executions performed, including the first.
    pub attempts: u32,
    /// Message of the last failed attempt, even if a later attempt succeeded.
    pub last_error: Option<String>,
    /// The run was cancelled while waiting to retry; `result` holds the
    /// failure that triggered the wait.
    pub cancelled: bool,
}

/// Stateless retry handler for connector invocations.
pub struct RetryHandler;

impl RetryHandler {
    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max)`.
    pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let ms = config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(config: &RetryConfig, attempt: u32, error: &ConnectorError) -> bool {
        attempt < config.max_attempts && error.is_retryable()
    }

    /// Invoke `connector` with `config`, retrying per `retry`.
    ///
    /// Each attempt is bounded by `timeout`; a timeout counts as a retryable
    /// failure. Cancellation interrupts the backoff sleep but never an attempt
    /// already in flight.
    pub async fn invoke(
        connector: &BoxConnector,
        config: &Value,
        retry: &RetryConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Invocation {
        let mut attempt = 0u32;
        let mut last_error = None;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, connector.invoke(config)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout(timeout)),
            };

            let err = match result {
                Ok(output) => {
                    return Invocation {
                        result: Ok(output),
                        attempts: attempt,
                        last_error,
                        cancelled: false,
                    };
                }
                Err(err) => err,
            };
            last_error = Some(err.to_string());

            if !Self::should_retry(retry, attempt, &err) {
                return Invocation {
                    result: Err(err),
                    attempts: attempt,
                    last_error,
                    cancelled: false,
                };
            }

            let delay = Self::backoff_delay(retry, attempt);
            tracing::warn!(
                connector = connector.name(),
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "connector invocation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(
                        connector = connector.name(),
                        attempt,
                        "retry abandoned, run cancelled"
                    );
                    return Invocation {
                        result: Err(err),
                        attempts: attempt,
                        last_error,
                        cancelled: true,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
