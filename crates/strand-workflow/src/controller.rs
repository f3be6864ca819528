use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use strand_core::config::NodeRetryConfig;
use strand_core::error::{Result, StrandError};
use strand_core::retry::exponential_backoff;

/// Retry policy for one invocation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub retryable: fn(&StrandError) -> bool,
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            exponential: false,
            retryable: StrandError::is_transport,
        }
    }

    pub fn from_config(config: &NodeRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            exponential: config.exponential,
            retryable: StrandError::is_transport,
        }
    }

    /// Delay before retrying after the failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if self.exponential {
            exponential_backoff(attempt, base_ms, u64::MAX)
        } else {
            self.base_delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NodeRetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are spent.
///
/// `op` receives the 0-based attempt number. `on_retry` sees each scheduled
/// retry as `(retry number starting at 1, delay, error)` before the sleep.
pub async fn with_retry<T, F, Fut, R>(mut op: F, policy: &RetryPolicy, mut on_retry: R) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, Duration, &StrandError),
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && (policy.retryable)(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                on_retry(attempt + 1, delay, &e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of one task in a [`run_parallel`] fan-out.
#[derive(Debug)]
pub struct TaskReport<T> {
    pub node_id: String,
    pub outcome: Result<T>,
    pub elapsed: Duration,
}

impl<T> TaskReport<T> {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<String> {
        self.outcome.as_ref().err().map(|e| e.to_string())
    }
}

/// Run every task with at most `max_concurrency` in flight.
///
/// Never short-circuits: one report per task, in input order, whatever the
/// individual outcomes.
pub async fn run_parallel<'a, T: Send + 'a>(
    tasks: Vec<(String, BoxFuture<'a, Result<T>>)>,
    max_concurrency: usize,
) -> Vec<TaskReport<T>> {
    let semaphore = Semaphore::new(max_concurrency.max(1));
    let semaphore = &semaphore;
    debug!(tasks = tasks.len(), max_concurrency, "Starting parallel fan-out");

    let runs = tasks.into_iter().map(|(node_id, task)| async move {
        // The semaphore is never closed, so acquiring cannot fail.
        let _permit = semaphore.acquire().await.ok();
        let started = Instant::now();
        let outcome = task.await;
        TaskReport {
            node_id,
            outcome,
            elapsed: started.elapsed(),
        }
    });
    futures::future::join_all(runs).await
}
