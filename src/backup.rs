//! Whole-collection backups to an external target.
//!
//! Only a local-folder target ships here. Remote providers plug in by
//! implementing [`BackupTarget`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::db::NoteStore;
use crate::error::{Error, Result};
use crate::types::Note;

pub const BACKUP_VERSION: u32 = 1;
pub const BACKUP_FILENAME: &str = "mindnote_backup.json";
const SYNC_METADATA_FILENAME: &str = "mindnote_sync.json";
const EXPORTED_BY: &str = "MindNote";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEnvelope {
    pub version: u32,
    /// Unix timestamp in ms
    pub timestamp: i64,
    #[serde(default)]
    pub notes: Vec<Note>,
    pub metadata: BackupMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub total_notes: usize,
    pub exported_by: String,
}

impl BackupEnvelope {
    pub fn new(notes: Vec<Note>, timestamp: i64) -> Self {
        let metadata = BackupMetadata { total_notes: notes.len(), exported_by: EXPORTED_BY.to_string() };
        Self { version: BACKUP_VERSION, timestamp, notes, metadata }
    }
}

/// When this device last wrote to and read from the target. 0 means never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub last_backup_time: i64,
    pub last_sync_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupInfo {
    /// Unix timestamp in ms
    pub modified: i64,
    pub size: u64,
}

#[async_trait]
pub trait BackupTarget: Send + Sync {
    /// Replace the stored backup with `notes`.
    async fn backup(&self, notes: &[Note]) -> Result<()>;
    /// Notes from the stored backup.
    async fn restore(&self) -> Result<Vec<Note>>;
    async fn has_backup(&self) -> Result<bool>;
    async fn backup_info(&self) -> Result<Option<BackupInfo>>;
}

/// Backup kept as a single JSON file in a directory, e.g. one synced by a
/// desktop cloud client.
pub struct LocalFolderBackup {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalFolderBackup {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self { dir: dir.into(), clock }
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILENAME)
    }

    fn sync_metadata_path(&self) -> PathBuf {
        self.dir.join(SYNC_METADATA_FILENAME)
    }

    /// Missing or unreadable sidecar reads as "never synced".
    pub async fn sync_metadata(&self) -> SyncMetadata {
        match tokio::fs::read_to_string(self.sync_metadata_path()).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable sync metadata: {e}");
                SyncMetadata::default()
            }),
            Err(_) => SyncMetadata::default(),
        }
    }

    async fn save_sync_metadata(&self, metadata: SyncMetadata) -> Result<()> {
        write_atomically(&self.sync_metadata_path(), &serde_json::to_vec_pretty(&metadata)?).await
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl BackupTarget for LocalFolderBackup {
    async fn backup(&self, notes: &[Note]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Backup(format!("cannot create {}: {e}", self.dir.display())))?;

        let now = self.clock.now_ms();
        let envelope = BackupEnvelope::new(notes.to_vec(), now);
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        write_atomically(&self.backup_path(), &bytes)
            .await
            .map_err(|e| Error::Backup(format!("cannot write {}: {e}", self.backup_path().display())))?;

        let mut sync = self.sync_metadata().await;
        sync.last_backup_time = now;
        self.save_sync_metadata(sync).await?;
        tracing::info!(notes = notes.len(), path = %self.backup_path().display(), "Backup written");
        Ok(())
    }

    async fn restore(&self) -> Result<Vec<Note>> {
        let path = self.backup_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Backup(format!("no backup found in {}", self.dir.display())));
            }
            Err(e) => return Err(Error::Backup(format!("cannot read {}: {e}", path.display()))),
        };
        let envelope: BackupEnvelope =
            serde_json::from_str(&raw).map_err(|e| Error::Backup(format!("backup file is corrupt: {e}")))?;

        let mut sync = self.sync_metadata().await;
        sync.last_sync_time = self.clock.now_ms();
        self.save_sync_metadata(sync).await?;
        Ok(envelope.notes)
    }

    async fn has_backup(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.backup_path()).await?)
    }

    async fn backup_info(&self) -> Result<Option<BackupInfo>> {
        let meta = match tokio::fs::metadata(self.backup_path()).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified().map(|t| DateTime::<Utc>::from(t).timestamp_millis()).unwrap_or(0);
        Ok(Some(BackupInfo { modified, size: meta.len() }))
    }
}

/// Import every note of the target's backup as a new note. Returns the count.
pub async fn restore_into(store: &dyn NoteStore, target: &dyn BackupTarget) -> Result<usize> {
    let notes = target.restore().await?;
    for note in &notes {
        store.import_note(&Note { id: 0, ..note.clone() }).await?;
    }
    tracing::info!(count = notes.len(), "Restored notes from backup");
    Ok(notes.len())
}
