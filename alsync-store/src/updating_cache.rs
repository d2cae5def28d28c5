//! The coordination ledger
//!
//! Every full path in the cache holds one of three shapes, depending on how
//! far the current pass has got with it:
//!
//! - a scanned marker (`true`) on directories that have been fully listed
//! - a change magnitude (`current modified - baseline modified`) on files
//! - a [`SyncTask`] once the path has been picked as a propagation target
//!
//! While the propagation phase runs the cache is locked and tasks can only be
//! changed through [`UpdateCache::update_status`] and the typed helpers built
//! on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::paths::ItemDirs;
use crate::store::{open_store, PathStore, StoreValue};

/// Progress of one target path through backup and copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Init,
    MovingOld,
    MovedOld,
    CopyingNew,
    CopiedNew,
    End,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What is kept of the file that a sync is about to overwrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: Option<i64>,
    pub modified: Option<String>,
    pub sign: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<i64>,
    pub provider: Option<String>,
    /// Original full path
    pub path: String,
    /// Stable identifier the backup file is named after
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Full path of the authoritative replica
    pub source: String,
    pub status: TaskStatus,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_old_info: Option<BackupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<i64>,
}

impl SyncTask {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: TaskStatus::Init,
            time: Utc::now(),
            target_old_info: None,
            source_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheEntry {
    Scanned(bool),
    Magnitude(i64),
    Task(SyncTask),
}

impl CacheEntry {
    pub fn as_magnitude(&self) -> Option<i64> {
        match self {
            Self::Magnitude(m) => Some(*m),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&SyncTask> {
        match self {
            Self::Task(task) => Some(task),
            _ => None,
        }
    }
}

impl StoreValue for CacheEntry {
    fn verify(&self, existing: Option<&Self>) -> bool {
        match (existing, self) {
            (Some(CacheEntry::Scanned(_)), _) => false,
            (Some(CacheEntry::Magnitude(_)), CacheEntry::Magnitude(_)) => false,
            _ => true,
        }
    }
}

/// Counts from [`UpdateCache::finish_pass`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub markers_removed: usize,
    pub magnitudes_removed: usize,
    pub tasks_removed: usize,
    pub tasks_kept: usize,
}

pub struct UpdateCache {
    store: Arc<dyn PathStore<CacheEntry>>,
    status_guard: Mutex<()>,
}

impl UpdateCache {
    pub const NAME: &'static str = "updating_cache";

    pub fn open(uri: &str, item_dirs: ItemDirs) -> Result<Self> {
        Ok(Self::new(open_store(uri, item_dirs, Self::NAME)?))
    }

    pub fn new(store: Arc<dyn PathStore<CacheEntry>>) -> Self {
        Self {
            store,
            status_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn PathStore<CacheEntry>> {
        &self.store
    }

    pub fn item_dirs(&self) -> &ItemDirs {
        self.store.item_dirs()
    }

    pub async fn get(&self, path: &str) -> Option<CacheEntry> {
        self.store.search(path).await
    }

    pub async fn is_scanned(&self, path: &str) -> bool {
        matches!(self.store.search(path).await, Some(CacheEntry::Scanned(true)))
    }

    pub async fn mark_scanned(&self, path: &str) -> Result<()> {
        self.store.update(path, CacheEntry::Scanned(true)).await
    }

    pub async fn set_magnitude(&self, path: &str, magnitude: i64) -> Result<()> {
        self.store.update(path, CacheEntry::Magnitude(magnitude)).await
    }

    pub async fn create_task(&self, path: &str, task: SyncTask) -> Result<()> {
        self.store.create(path, CacheEntry::Task(task)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(path).await
    }

    /// Lock transitions share the status mutex with task updates, so a lock
    /// change cannot land inside an update's unlock-write-relock window.
    pub async fn lock(&self) -> Result<()> {
        let _guard = self.status_guard.lock().await;
        self.store.lock().await?;
        info!("Update cache locked for propagation");
        Ok(())
    }

    pub async fn unlock(&self) -> Result<()> {
        let _guard = self.status_guard.lock().await;
        self.store.unlock().await?;
        info!("Update cache unlocked");
        Ok(())
    }

    pub async fn is_locked(&self) -> bool {
        self.store.is_locked().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Set one field of the task stored at `path`.
    ///
    /// Works while the cache is locked: the lock is released for the single
    /// write and taken again afterwards, all under the status guard.
    pub async fn update_status(&self, path: &str, key: &str, value: Value) -> Result<SyncTask> {
        let updated = self
            .modify_task(path, |task| {
                let previous = task.status;
                let mut record = serde_json::to_value(&*task)?;
                if let Value::Object(map) = &mut record {
                    map.insert(key.to_string(), value);
                }
                let next: SyncTask = serde_json::from_value(record)?;
                if next.status < previous {
                    return Err(StoreError::InvalidStateTransition {
                        from: previous.to_string(),
                        to: next.status.to_string(),
                    });
                }
                *task = next;
                Ok(true)
            })
            .await?;

        // modify_task only skips the write when the closure says so
        updated.ok_or_else(|| StoreError::NotARecord(path.to_string()))
    }

    /// Move a task from `from` to `to`.
    ///
    /// Returns `false` without writing when the task is no longer in `from`,
    /// which makes repeated polling harmless.
    pub async fn advance(&self, path: &str, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        if to <= from {
            return Err(StoreError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let written = self
            .modify_task(path, |task| {
                if task.status != from {
                    return Ok(false);
                }
                task.status = to;
                Ok(true)
            })
            .await?;

        if written.is_some() {
            debug!("{}: {} -> {}", path, from, to);
        }
        Ok(written.is_some())
    }

    pub async fn set_backup_info(&self, path: &str, info: BackupInfo) -> Result<()> {
        self.modify_task(path, move |task| {
            task.target_old_info = Some(info);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    pub async fn set_source_size(&self, path: &str, size: Option<i64>) -> Result<()> {
        self.modify_task(path, move |task| {
            task.source_size = size;
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn modify_task<F>(&self, path: &str, change: F) -> Result<Option<SyncTask>>
    where
        F: FnOnce(&mut SyncTask) -> Result<bool> + Send,
    {
        let _guard = self.status_guard.lock().await;

        let mut task = match self.store.search(path).await {
            Some(CacheEntry::Task(task)) => task,
            _ => return Err(StoreError::NotARecord(path.to_string())),
        };

        if !change(&mut task)? {
            return Ok(None);
        }

        let entry = CacheEntry::Task(task.clone());
        if self.store.is_locked().await {
            self.store.unlock().await?;
            let written = self.store.update(path, entry).await;
            self.store.lock().await?;
            written?;
        } else {
            self.store.update(path, entry).await?;
        }

        Ok(Some(task))
    }

    /// Every task in the cache, in item then sub-path order
    pub async fn tasks(&self) -> Result<Vec<(String, SyncTask)>> {
        Ok(self
            .store
            .full_paths()
            .await?
            .into_iter()
            .filter_map(|(path, entry)| match entry {
                CacheEntry::Task(task) => Some((path, task)),
                _ => None,
            })
            .collect())
    }

    pub async fn tasks_in(&self, status: TaskStatus) -> Result<Vec<(String, SyncTask)>> {
        Ok(self
            .tasks()
            .await?
            .into_iter()
            .filter(|(_, task)| task.status == status)
            .collect())
    }

    pub async fn has_tasks(&self) -> Result<bool> {
        Ok(!self.tasks().await?.is_empty())
    }

    /// Close a pass: drop scanned markers, leftover magnitudes and finished
    /// tasks so the next pass lists every directory again. Unfinished tasks
    /// stay for inspection.
    pub async fn finish_pass(&self) -> Result<PassSummary> {
        if self.is_locked().await {
            return Err(StoreError::Locked("finish_pass".to_string()));
        }

        let mut summary = PassSummary::default();
        for (path, entry) in self.store.full_paths().await? {
            match entry {
                CacheEntry::Scanned(_) => {
                    self.store.delete(&path).await?;
                    summary.markers_removed += 1;
                }
                CacheEntry::Magnitude(_) => {
                    self.store.delete(&path).await?;
                    summary.magnitudes_removed += 1;
                }
                CacheEntry::Task(task) if task.status == TaskStatus::End => {
                    self.store.delete(&path).await?;
                    summary.tasks_removed += 1;
                }
                CacheEntry::Task(task) => {
                    warn!("Keeping unfinished task {} ({})", path, task.status);
                    summary.tasks_kept += 1;
                }
            }
        }

        info!(
            "Pass finished: {} markers, {} magnitudes, {} tasks removed, {} tasks kept",
            summary.markers_removed,
            summary.magnitudes_removed,
            summary.tasks_removed,
            summary.tasks_kept
        );
        Ok(summary)
    }
}
