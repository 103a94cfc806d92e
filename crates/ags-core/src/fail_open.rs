//! Fail-open utilities for graceful degradation
//!
//! Infrastructure work around the pipeline (the final ledger flush, CI
//! artifact export, cleanup) must never take the process down with it.
//! These helpers log the failure and carry on.
//!
//! DO NOT use fail-open for:
//! - Agent invocation (failures there feed the ledger and breakers)
//! - Gate decisions
//! - Ledger loading (it has its own backup/reset recovery chain)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use ags_core::fail_open::fail_open;
/// use ags_core::Result;
///
/// async fn export_artifact() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let exported = fail_open("artifact_export", || export_artifact()).await;
///     // exported is None if export_artifact() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
