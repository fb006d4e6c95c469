use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AdapterError;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_millis(500);
pub const BACKOFF_FACTOR: u32 = 2;

/// Runs `op` with exponential backoff on transient failures.
///
/// Non-transient errors (and in particular
/// [`AdapterError::ManualUploadRequired`]) are returned immediately.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut delay = BASE_DELAY;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(%label, attempt, ?delay, error = %err, "transient adapter failure; backing off");
                tokio::time::sleep(delay).await;
                delay *= BACKOFF_FACTOR;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    // Only reachable if every attempt was transient.
    Err(last_err.unwrap_or(AdapterError::Http("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AdapterError::Http("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn manual_upload_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AdapterError::ManualUploadRequired {
                    isin: "IE00B4L5Y983".into(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(AdapterError::ManualUploadRequired { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
