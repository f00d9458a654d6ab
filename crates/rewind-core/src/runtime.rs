//! Deadline enforcement for backend calls.
//!
//! Ledger and record store operations may block on storage I/O. Every call
//! made by the engine goes through [`with_timeout`]; a call that overruns
//! fails with `Timeout` and whatever it wrote stays orphaned and invisible,
//! since nothing becomes readable without a COMMITTED turn.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{RewindError, RewindResult};

/// Run `fut`, failing with [`RewindError::Timeout`] after `timeout`.
pub async fn with_timeout<F, T>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> RewindResult<T>
where
    F: Future<Output = RewindResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?timeout, "Operation timed out");
            Err(RewindError::Timeout { operation, timeout })
        }
    }
}
