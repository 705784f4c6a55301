//! Bounded polling for remote conditions.
//!
//! The check is evaluated immediately and then once per interval until it
//! yields a value or the timeout elapses. A failing check aborts the wait.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Error, Debug)]
pub enum PollError<E> {
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("check failed while waiting: {0}")]
    Check(#[source] E),
}

pub type PollResult<T, E> = std::result::Result<T, PollError<E>>;

/// Waits until `check` returns `Some`, returning the produced value.
pub async fn poll_until<F, Fut, T, E>(config: &PollConfig, what: &str, mut check: F) -> PollResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + config.timeout;

    loop {
        if let Some(value) = check().await.map_err(PollError::Check)? {
            return Ok(value);
        }

        if Instant::now() + config.interval > deadline {
            return Err(PollError::Timeout {
                what: what.to_string(),
                timeout: config.timeout,
            });
        }

        debug!(what, interval = ?config.interval, "condition not met yet");
        sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn config() -> PollConfig {
        PollConfig::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_satisfied() {
        let start = Instant::now();
        let result: PollResult<u32, &str> =
            poll_until(&config(), "value", || async { Ok(Some(7)) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_one_interval_per_failed_check() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = Instant::now();

        let result: PollResult<&str, &str> = poll_until(&config(), "third call", move || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    2 => Ok(Some("done")),
                    _ => Ok(None),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_satisfied() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: PollResult<(), &str> = poll_until(&config(), "nothing", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;

        assert!(matches!(result, Err(PollError::Timeout { .. })));
        // checks at 0s, 10s, ... 60s
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_aborts_the_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: PollResult<(), &str> = poll_until(&config(), "error", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;

        assert!(matches!(result, Err(PollError::Check("boom"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
