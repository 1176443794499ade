//! Async test helpers
//!
//! Channel and timeout utilities shared across the test suites.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Receive from a channel with a timeout
pub async fn recv_timeout<T>(
    rx: &mut mpsc::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Assert a future completes within the duration, returning its output
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Assert a future does NOT complete within the duration
pub async fn assert_times_out<F, T>(duration: Duration, future: F)
where
    F: Future<Output = T>,
{
    if timeout(duration, future).await.is_ok() {
        panic!(
            "Expected future to timeout, but it completed within {:?}",
            duration
        );
    }
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until<F, Fut>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
