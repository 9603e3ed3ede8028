use std::{error::Error, future::Future, time::Duration};

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, timeout};

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Soft deadline applied to every store and cache call.
pub const IO_DEADLINE: Duration = Duration::from_secs(3);

/// Base backoff before the single retry of a failed store call.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The call did not complete before its soft deadline.
    #[error("storage operation `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Run a storage future under the soft deadline, mapping expiry to [`StorageError::Timeout`].
pub async fn with_deadline<T, Fut>(
    operation: &'static str,
    limit: Duration,
    future: Fut,
) -> StorageResult<T>
where
    Fut: Future<Output = StorageResult<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Run `attempt` and, when it fails, run it exactly once more after a jittered backoff.
pub async fn retry_once<T, E, F, Fut>(base_delay: Duration, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(_) => {
            sleep(jittered(base_delay)).await;
            attempt().await
        }
    }
}

/// Store call with a soft deadline per attempt, retried once after a jittered backoff.
pub async fn with_deadline_retry<T, F, Fut>(
    operation: &'static str,
    limit: Duration,
    mut attempt: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    retry_once(RETRY_BASE_DELAY, || with_deadline(operation, limit, attempt())).await
}

/// Exponential-style jitter: a random delay in `[base, 2 * base)`.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let extra = rand::rng().random_range(0..base_ms);
    Duration::from_millis(base_ms + extra)
}
