//! CI artifact sync
//!
//! CI runners start from a clean checkout, so the ledger travels between
//! runs as a build artifact. At start the downloaded artifact seeds the
//! local store; at the end the ledger is written back out for upload.

use ags_core::Result;
use std::path::Path;
use tracing::info;

use crate::model::LedgerData;
use crate::storage::{write_atomic, LedgerStorage};

/// Whether the process runs under CI (`GITHUB_ACTIONS` or `CI` set to `true`)
pub fn running_in_ci() -> bool {
    ci_from(|name| std::env::var(name).ok())
}

fn ci_from(var: impl Fn(&str) -> Option<String>) -> bool {
    ["GITHUB_ACTIONS", "CI"]
        .iter()
        .any(|name| var(name).as_deref() == Some("true"))
}

/// Seed `storage` from the artifact at `path`
///
/// Returns `Ok(None)` when no artifact was downloaded. An artifact that does
/// not parse is an error and leaves the storage untouched.
pub async fn import_artifact<S: LedgerStorage + ?Sized>(
    path: &Path,
    storage: &S,
) -> Result<Option<LedgerData>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No ledger artifact at {:?}, starting fresh", path);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let data = LedgerData::from_json(&content)?;
    storage.save(&data).await?;

    info!(
        error_patterns = data.error_patterns.len(),
        agent_health = data.agent_health.len(),
        improvements = data.improvements.len(),
        "Imported ledger artifact from {:?}",
        path
    );
    Ok(Some(data))
}

/// Write the ledger out for artifact upload
pub async fn export_artifact(data: &LedgerData, path: &Path) -> Result<()> {
    write_atomic(path, data).await?;
    info!("Exported ledger artifact to {:?}", path);
    Ok(())
}
