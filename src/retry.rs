//! Bounded fixed-interval retry
//!
//! Each class of external call (pod patch/delete, Patroni queries, switchover)
//! gets its own [`RetryPolicy`] so short operations give up in seconds while
//! failover may keep trying for minutes.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Poll interval and total time budget for a retried call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::ConfigError(format!("{name}: interval must be positive")));
        }
        if self.timeout < self.interval {
            return Err(Error::ConfigError(format!(
                "{name}: timeout ({:?}) should be greater than interval ({:?})",
                self.timeout, self.interval
            )));
        }
        Ok(())
    }

    /// Number of attempts that fit into the budget, at least one
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_millis() / self.interval.as_millis().max(1);
        attempts.clamp(1, u32::MAX as u128) as u32
    }

    /// Run `f` until it succeeds or the budget is spent.
    ///
    /// Fatal errors are returned immediately. After the last failed attempt
    /// the error is wrapped in [`Error::RetryExhausted`].
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(Error::RetryExhausted {
                        operation: operation.to_string(),
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, attempt, attempts, e, self.interval
                    );
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Run `f` until it reports completion with `Ok(true)`.
    ///
    /// `Ok(false)` asks for another attempt; an `Err` aborts immediately.
    pub async fn retry_until<F, Fut>(&self, operation: &str, mut f: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let attempts = self.max_attempts();
        for attempt in 1..=attempts {
            if f().await? {
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(Error::RetryExhausted {
            operation: operation.to_string(),
            attempts,
            source: Box::new(Error::WaitTimeout(operation.to_string())),
        })
    }
}
