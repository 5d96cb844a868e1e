//! Timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::CommonError;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(limit: Duration, operation: F) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    timeout(limit, operation()).await.map_err(|_| {
        debug!(?limit, "Operation timed out");
        CommonError::Timeout(limit)
    })
}

/// Run a future under an optional deadline. `None` waits indefinitely.
pub async fn maybe_timeout<T, Fut>(limit: Option<Duration>, future: Fut) -> Result<T, CommonError>
where
    Fut: Future<Output = T>,
{
    match limit {
        Some(limit) => with_timeout(limit, || future).await,
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(CommonError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_within_deadline() {
        let result = with_timeout(Duration::from_secs(1), || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_maybe_timeout_without_limit() {
        let result = maybe_timeout(None, async { "done" }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_maybe_timeout_with_limit() {
        let result = maybe_timeout(Some(Duration::from_millis(5)), futures_pending()).await;
        assert!(result.unwrap_err().is_timeout());
    }

    async fn futures_pending() {
        std::future::pending::<()>().await
    }
}
