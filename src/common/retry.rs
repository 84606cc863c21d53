// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry an async operation with exponential backoff while `retryable`
/// accepts the error. `op` receives the 1-based attempt number.
pub async fn retry_async<F, Fut, T, E, R>(
    mut op: F,
    retryable: R,
    attempts: usize,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && retryable(&e) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient(e: &AppError) -> bool {
        matches!(e, AppError::Connection(_) | AppError::Cache(_))
    }

    #[tokio::test]
    async fn cache_connect_is_retried_until_it_comes_up() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, AppError> = retry_async(
            |_| {
                let current = counter.fetch_add(1, Ordering::Relaxed);
                async move {
                    if current < 2 {
                        Err(AppError::Connection("redis refused".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            },
            transient,
            4,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(res.expect("connected"), 7);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn config_errors_fail_on_first_attempt() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, AppError> = retry_async(
            |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err(AppError::Config("bad redis url".to_string())) }
            },
            transient,
            5,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(res, Err(AppError::Config(_))));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, AppError> = retry_async(
            |attempt| {
                counter.fetch_add(1, Ordering::Relaxed);
                async move { Err(AppError::Cache(format!("attempt {attempt}"))) }
            },
            transient,
            3,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(res, Err(AppError::Cache(msg)) if msg == "attempt 3"));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
