//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How often and how long to retry
#[derive(Debug, Clone)]
pub struct WaitOptions {
    retry_interval: Duration,
    allowed_errors: usize,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            retry_interval: Duration::from_secs(1),
            allowed_errors: 3,
        }
    }
}

impl WaitOptions {
    /// Delay before the first retry; doubled after each further failure
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Number of temporary failures tolerated before giving up
    pub fn allowed_errors(mut self, allowed_errors: usize) -> Self {
        self.allowed_errors = allowed_errors;
        self
    }
}

/// Result of a single attempt
#[derive(Debug)]
pub enum WaitStatus<T, E> {
    Finished(T),
    FailedTemporarily(E),
    FailedPermanently(E),
}

/// Run `f` until it finishes, fails permanently, or exhausts the allowed errors
pub async fn wait<T, E, F, Fut>(options: &WaitOptions, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = WaitStatus<T, E>>,
{
    let mut errors = 0;
    let mut interval = options.retry_interval;

    loop {
        match f().await {
            WaitStatus::Finished(value) => return Ok(value),
            WaitStatus::FailedPermanently(err) => return Err(err),
            WaitStatus::FailedTemporarily(err) => {
                errors += 1;
                if errors > options.allowed_errors {
                    return Err(err);
                }

                warn!(
                    "Attempt failed ({}), retrying in {:?} ({}/{})",
                    err, interval, errors, options.allowed_errors
                );

                sleep(interval).await;
                interval = interval.saturating_mul(2);
            }
        }
    }
}
