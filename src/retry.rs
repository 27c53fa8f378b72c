//! Fixed-delay retries for the bootstrap helper.

use std::future::Future;
use std::time::Duration;

use log::{error, warn};

use crate::errors::*;

/// A bounded number of attempts separated by a fixed delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// Returns the last error on exhaustion. Fatal errors (see [`Error::is_fatal`]) are
    /// returned immediately.
    pub async fn retry<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(err) if err.is_fatal() => {
                    error!("{} failed fatally: {}", name, err);
                    return Err(err);
                }
                Err(err) if attempt >= self.attempts => {
                    error!("{} failed after {} attempts: {}", name, attempt, err);
                    return Err(err);
                }
                Err(err) => {
                    warn!("{} failed (attempt {}/{}), retrying in {:?}: {}", name, attempt, self.attempts, self.delay, err);
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
