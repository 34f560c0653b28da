// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod abi;
pub mod chain_reader;
pub mod clock;
pub mod config;
pub mod countdown;
pub mod engine;
pub mod error;
pub mod eth_reader;
pub mod events;
pub mod format;
pub mod lifecycle;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod read_model_cache;
pub mod server;
pub mod snapshot;
pub mod types;

#[cfg(test)]
pub mod test_utils;

/// Retries `$func` with exponential backoff while it fails with a transient
/// `ReadError`, giving up once `$max_elapsed_time` has passed. Permanent
/// errors return immediately.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if $crate::error::ReadError::is_transient(&e) => {
                        tracing::debug!("Retrying due to transient error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}

#[cfg(test)]
mod tests {
    use crate::error::ReadError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn example_func_ok() -> Result<u64, ReadError> {
        Ok(7)
    }

    async fn example_func_err(calls: &AtomicUsize, error: ReadError) -> Result<u64, ReadError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(error)
    }

    #[tokio::test]
    async fn test_retry_with_max_elapsed_time() {
        // no retry is needed, should return immediately. We give it a very small
        // max_elapsed_time and it should still finish in time.
        let max_elapsed_time = Duration::from_millis(20);
        assert_eq!(
            retry_with_max_elapsed_time!(example_func_ok(), max_elapsed_time).unwrap(),
            7
        );

        // a transient error is retried until the budget runs out
        let calls = AtomicUsize::new(0);
        let max_elapsed_time = Duration::from_secs(1);
        let instant = std::time::Instant::now();
        retry_with_max_elapsed_time!(
            example_func_err(&calls, ReadError::Transport("connection refused".into())),
            max_elapsed_time
        )
        .unwrap_err();
        assert!(calls.load(Ordering::SeqCst) > 1);
        assert!(instant.elapsed() < max_elapsed_time * 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = retry_with_max_elapsed_time!(
            example_func_err(&calls, ReadError::Decode("short buffer".into())),
            Duration::from_secs(10)
        )
        .unwrap_err();
        assert_eq!(err, ReadError::Decode("short buffer".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
