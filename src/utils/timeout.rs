//! Async timeout and cancellation helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default bound for a single send or connect.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for the whole three-message handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a server waits for its channels to drain on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Run `fut` until it finishes, `limit` elapses, or `cancel` fires.
///
/// Cancellation wins ties so a closing channel reports `Cancelled` rather than
/// a timeout that raced it.
pub async fn guarded<F, T>(fut: F, limit: Option<Duration>, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            result = with_timeout_error(fut, duration) => result,
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            result = fut => result,
        },
    }
}
