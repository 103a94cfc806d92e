//! Ledger storage
//!
//! The ledger is handed its storage rather than reaching for a global file.
//! [`FileLedgerStorage`] is the durable implementation:
//!
//! - **save**: copy the current (valid) primary to `<file>.bak`, write the new
//!   content to `<file>.tmp`, fsync, then atomically rename over the primary
//! - **load**: primary, else backup (restoring the primary from it), else an
//!   empty ledger written fresh
//!
//! A crash at any point of a save leaves either the old or the new primary in
//! place, and a damaged primary is recovered from the backup on next load.

use ags_core::{AgsError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::model::LedgerData;

/// Where ledger data is loaded from and saved to
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Load the persisted ledger, recovering or resetting if needed
    async fn load(&self) -> Result<LedgerData>;

    /// Persist the full ledger
    async fn save(&self, data: &LedgerData) -> Result<()>;
}

#[async_trait]
impl<T: LedgerStorage + ?Sized> LedgerStorage for Arc<T> {
    async fn load(&self) -> Result<LedgerData> {
        (**self).load().await
    }

    async fn save(&self, data: &LedgerData) -> Result<()> {
        (**self).save(data).await
    }
}

/// Outcome of reading one ledger file
enum ReadOutcome {
    Missing,
    Invalid(AgsError),
    Valid(LedgerData),
}

/// Crash-safe JSON file storage
#[derive(Debug, Clone)]
pub struct FileLedgerStorage {
    path: PathBuf,
    backup_path: PathBuf,
}

impl FileLedgerStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = sibling(&path, "bak");
        Self { path, backup_path }
    }

    /// Primary ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backup kept from the previous save
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    async fn read(path: &Path) -> ReadOutcome {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ReadOutcome::Missing,
            Err(e) => return ReadOutcome::Invalid(e.into()),
        };

        match LedgerData::from_json(&content) {
            Ok(data) => ReadOutcome::Valid(data),
            Err(e) => ReadOutcome::Invalid(e),
        }
    }

    async fn backup_current(&self) {
        // Only a primary that still parses is worth keeping; copying a torn
        // file would destroy the last good backup.
        match Self::read(&self.path).await {
            ReadOutcome::Valid(_) => {
                if let Err(e) = fs::copy(&self.path, &self.backup_path).await {
                    warn!("Failed to back up ledger to {:?}, continuing: {}", self.backup_path, e);
                }
            }
            ReadOutcome::Missing => {}
            ReadOutcome::Invalid(e) => {
                warn!("Not backing up invalid ledger {:?}: {}", self.path, e);
            }
        }
    }
}

#[async_trait]
impl LedgerStorage for FileLedgerStorage {
    async fn load(&self) -> Result<LedgerData> {
        let primary_missing = match Self::read(&self.path).await {
            ReadOutcome::Valid(data) => return Ok(data),
            ReadOutcome::Missing => true,
            ReadOutcome::Invalid(e) => {
                error!("Failed to load ledger from {:?}, trying backup: {}", self.path, e);
                false
            }
        };

        match Self::read(&self.backup_path).await {
            ReadOutcome::Valid(data) => {
                match fs::copy(&self.backup_path, &self.path).await {
                    Ok(_) => info!("Restored ledger {:?} from backup", self.path),
                    Err(e) => warn!("Loaded ledger backup but could not restore primary: {}", e),
                }
                return Ok(data);
            }
            ReadOutcome::Missing => {
                if primary_missing {
                    info!("No ledger at {:?}, starting fresh", self.path);
                } else {
                    error!("No ledger backup at {:?}, resetting", self.backup_path);
                }
            }
            ReadOutcome::Invalid(e) => {
                error!("Failed to load ledger backup, resetting: {}", e);
            }
        }

        let data = LedgerData::default();
        if let Err(e) = write_atomic(&self.path, &data).await {
            warn!("Failed to write fresh ledger to {:?}: {}", self.path, e);
        }
        Ok(data)
    }

    async fn save(&self, data: &LedgerData) -> Result<()> {
        self.backup_current().await;
        write_atomic(&self.path, data).await?;
        debug!("Saved ledger to {:?}", self.path);
        Ok(())
    }
}

/// Volatile storage for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryLedgerStorage {
    data: Mutex<LedgerData>,
    saves: AtomicUsize,
}

impl MemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing content
    pub fn with_data(data: LedgerData) -> Self {
        Self {
            data: Mutex::new(data),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Last saved content
    pub async fn snapshot(&self) -> LedgerData {
        self.data.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedgerStorage {
    async fn load(&self) -> Result<LedgerData> {
        Ok(self.data.lock().await.clone())
    }

    async fn save(&self, data: &LedgerData) -> Result<()> {
        *self.data.lock().await = data.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Write `data` next to `path` as `<file>.tmp`, fsync, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, data: &LedgerData) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_vec_pretty(data)?;
    let temp_path = sibling(path, "tmp");

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
