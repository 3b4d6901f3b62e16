//! Exponential backoff around one adapter call.

use crate::cancel::{CancelToken, Cancelled};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Auth and routing failures retry to the same outcome; bail on them at once.
const NON_RETRIABLE_STATUSES: [&str; 3] = ["401", "403", "404"];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub fn is_non_retriable(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    NON_RETRIABLE_STATUSES.iter().any(|code| msg.contains(code))
}

impl RetryPolicy {
    /// Runs `op` with doubling delays between attempts. Cancellation aborts
    /// the backoff sleep; the last failure is the one reported.
    pub async fn run<T, F, Fut>(&self, cancel: &CancelToken, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.is::<Cancelled>() {
                        return Err(err);
                    }
                    if attempt >= self.max_attempts || is_non_retriable(&err) {
                        return Err(err);
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %err,
                        "provider call failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Cancelled.into()),
                    }
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}
