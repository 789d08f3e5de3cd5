//! Bounded exponential backoff around collaborator calls.
//!
//! Every external call site goes through [`RetryPolicy::run`] (async) or
//! [`RetryPolicy::run_blocking`] (blocking work dispatched to the worker
//! pool). Only failures classified as transient are retried; fatal failures
//! and the last transient failure propagate unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::CollaboratorError;

/// Upper bound of the jitter, as a fraction of the capped delay.
const JITTER_FRACTION: f64 = 0.1;

/// Call classes with distinct retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallClass {
    /// Transcription, AI, search, upload and notification calls.
    Api,
    /// Candidate downloads.
    Download,
    /// Local filesystem operations.
    File,
}

/// Retry parameters for one call class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn api() -> Self {
        Self::new(5, Duration::from_secs(2), Duration::from_secs(120))
    }

    pub fn download() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(60))
    }

    pub fn file() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Deterministic part of the delay before retry number `attempt + 1`:
    /// `min(base * 2^attempt, max_delay)`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(63) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay actually slept: the base backoff plus jitter uniformly drawn
    /// from `[0, 0.1 * base_backoff]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        base + base.mul_f64(jitter)
    }

    /// Run an async operation, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        kind = e.kind(),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(
                            operation,
                            retries = self.max_retries,
                            error = %e,
                            "Giving up after exhausting retries"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run a blocking operation on the worker pool, retrying transient
    /// failures. The calling task suspends without blocking the scheduler.
    pub async fn run_blocking<T, F>(&self, operation: &str, call: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, CollaboratorError> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        self.run(operation, || {
            let call = Arc::clone(&call);
            async move {
                tokio::task::spawn_blocking(move || call())
                    .await
                    .map_err(|e| CollaboratorError::Internal(format!("worker task failed: {e}")))?
            }
        })
        .await
    }
}

/// Retry policies for every call class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub api: RetryPolicy,
    pub download: RetryPolicy,
    pub file: RetryPolicy,
}

impl RetrySettings {
    pub fn for_class(&self, class: CallClass) -> &RetryPolicy {
        match class {
            CallClass::Api => &self.api,
            CallClass::Download => &self.download,
            CallClass::File => &self.file,
        }
    }

    /// Same budgets with near-zero delays, for tests and dry runs.
    pub fn immediate() -> Self {
        let quick = |max_retries| {
            RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
        };
        Self {
            api: quick(5),
            download: quick(3),
            file: quick(3),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            api: RetryPolicy::api(),
            download: RetryPolicy::download(),
            file: RetryPolicy::file(),
        }
    }
}
