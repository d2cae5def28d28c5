//! Pass lifecycle
//!
//! A pass scans every item directory, resolves every sub-path, locks the
//! update cache when there is work, then propagates. The cache stays locked
//! until every task reached `End`, so an interrupted run resumes
//! propagation instead of scanning again.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use alsync_remote::RemoteStorage;
use alsync_store::paths::ROOT_SUB_PATH;
use alsync_store::{
    spawn_flush_task, CacheEntry, FileRecordStore, ItemDirs, TaskStatus, UpdateCache,
};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::errors::{Result, SyncError};
use crate::scanner::Scanner;
use crate::workers::{Phase, PhaseReport, Worker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Tasks were created and the cache is now locked
    Ready { tasks: usize },
    /// No replica changed; nothing was locked
    NothingToSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    NothingToSync,
    Completed {
        tasks: usize,
    },
    /// Some tasks did not reach `End`; the cache stays locked
    Incomplete {
        unfinished: Vec<(String, TaskStatus)>,
    },
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !matches!(self, RunReport::Incomplete { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropagationStats {
    pub backup: PhaseReport,
    pub copy: PhaseReport,
    pub finalized: usize,
}

pub struct SyncCoordinator {
    remote: Arc<dyn RemoteStorage>,
    records: Arc<FileRecordStore>,
    cache: Arc<UpdateCache>,
    config: Arc<SyncConfig>,
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        records: Arc<FileRecordStore>,
        cache: Arc<UpdateCache>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        if records.store().item_dirs() != cache.item_dirs() {
            return Err(SyncError::Config(
                "file records and update cache disagree on item directories".to_string(),
            ));
        }
        if cache.item_dirs().len() < 2 {
            return Err(SyncError::Config(
                "at least two item directories are required".to_string(),
            ));
        }

        Ok(Self {
            remote,
            records,
            cache,
            config: Arc::new(config),
        })
    }

    /// Open both stores at `cache_uri` and build a coordinator
    pub fn open(
        remote: Arc<dyn RemoteStorage>,
        item_dirs: ItemDirs,
        cache_uri: &str,
        config: SyncConfig,
    ) -> Result<Self> {
        let records = Arc::new(FileRecordStore::open(cache_uri, item_dirs.clone())?);
        let cache = Arc::new(UpdateCache::open(cache_uri, item_dirs)?);
        Self::new(remote, records, cache, config)
    }

    pub fn cache(&self) -> &Arc<UpdateCache> {
        &self.cache
    }

    pub fn records(&self) -> &Arc<FileRecordStore> {
        &self.records
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.records),
            Arc::clone(&self.cache),
            self.config.backup_dir_name.clone(),
            self.config.page_size,
        )
    }

    fn worker(&self) -> Worker {
        Worker::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.cache),
            Arc::clone(&self.config),
        )
    }

    /// Scan every item, resolve every sub-path and lock the cache when
    /// tasks were created
    pub async fn scan_all(&self) -> Result<ScanOutcome> {
        if self.cache.is_locked().await {
            return Err(SyncError::CacheLocked);
        }

        let stats = self.scanner().scan_items(self.cache.item_dirs()).await?;
        info!(
            "Scan finished: {} directories, {} files, {} skipped",
            stats.directories, stats.files, stats.skipped
        );

        let resolver = ConflictResolver::new(Arc::clone(&self.cache));
        let mut propagating = 0;
        for sub_path in self.cache.store().all_sub_paths().await? {
            if sub_path == ROOT_SUB_PATH {
                continue;
            }
            if let Resolution::Propagate { .. } = resolver.resolve(&sub_path).await? {
                propagating += 1;
            }
        }

        let tasks = self.cache.tasks().await?.len();
        if tasks == 0 {
            info!("Nothing to sync");
            return Ok(ScanOutcome::NothingToSync);
        }

        self.cache.lock().await?;
        info!(
            "{} sub-path(s) to propagate, {} task(s) queued",
            propagating, tasks
        );
        Ok(ScanOutcome::Ready { tasks })
    }

    /// Drive every task through backup and copy.
    ///
    /// The cache must be locked. It is unlocked and the pass closed only
    /// when every task reached `End`.
    pub async fn propagate(&self, shutdown: watch::Receiver<bool>) -> Result<RunReport> {
        let (report, _) = self.propagate_with_stats(shutdown).await?;
        Ok(report)
    }

    pub async fn propagate_with_stats(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(RunReport, PropagationStats)> {
        if !self.cache.is_locked().await {
            return Err(SyncError::NotLocked);
        }

        let worker = self.worker();
        worker.ensure_backup_dirs().await?;

        let backup = worker.run_phase(Phase::Backup, shutdown.clone()).await?;
        let copy = worker.run_phase(Phase::Copy, shutdown).await?;
        let finalized = worker.finalize().await?;
        let stats = PropagationStats {
            backup,
            copy,
            finalized,
        };

        let tasks = self.cache.tasks().await?;
        let unfinished: Vec<(String, TaskStatus)> = tasks
            .iter()
            .filter(|(_, task)| task.status != TaskStatus::End)
            .map(|(path, task)| (path.clone(), task.status))
            .collect();

        if !unfinished.is_empty() {
            for (path, status) in &unfinished {
                warn!("Unfinished task {} stuck in {}", path, status);
            }
            return Ok((RunReport::Incomplete { unfinished }, stats));
        }

        self.cache.unlock().await?;
        self.cache.finish_pass().await?;
        info!("Propagation complete: {} task(s)", tasks.len());
        Ok((RunReport::Completed { tasks: tasks.len() }, stats))
    }

    /// One full pass, resuming an interrupted propagation when the cache is
    /// still locked. Dirty stores are flushed periodically and on the way
    /// out.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunReport> {
        let (flush_tx, flush_rx) = watch::channel(false);
        let flushers = vec![
            spawn_flush_task(
                Arc::clone(self.records.store()),
                self.config.flush_interval,
                flush_rx.clone(),
            ),
            spawn_flush_task(
                Arc::clone(self.cache.store()),
                self.config.flush_interval,
                flush_rx,
            ),
        ];

        let result = self.run_pass(shutdown).await;

        let _ = flush_tx.send(true);
        for handle in flushers {
            if let Err(e) = handle.await {
                warn!("Flush task ended abnormally: {}", e);
            }
        }
        result
    }

    async fn run_pass(&self, shutdown: watch::Receiver<bool>) -> Result<RunReport> {
        if self.cache.is_locked().await {
            info!("Update cache is locked, resuming interrupted propagation");
            return self.propagate(shutdown).await;
        }

        match self.scan_all().await? {
            ScanOutcome::NothingToSync => {
                self.cache.finish_pass().await?;
                Ok(RunReport::NothingToSync)
            }
            ScanOutcome::Ready { .. } => self.propagate(shutdown).await,
        }
    }

    /// Every cache entry, for inspection
    pub async fn status(&self) -> Result<Vec<(String, CacheEntry)>> {
        Ok(self.cache.store().full_paths().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alsync_remote::MemoryRemote;
    use alsync_store::SyncTask;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: Some(100),
            flush_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        }
    }

    async fn coordinator() -> (Arc<MemoryRemote>, SyncCoordinator) {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_dir("/a").await;
        remote.put_dir("/b").await;
        let items = ItemDirs::new(["/a", "/b"]).unwrap();
        let coordinator =
            SyncCoordinator::open(remote.clone(), items, "memory://", config()).unwrap();
        (remote, coordinator)
    }

    #[tokio::test]
    async fn test_scan_all_seeds_tasks_and_locks() {
        let (remote, coordinator) = coordinator().await;
        remote.put_file("/a/f.txt", b"new", at(200)).await;
        remote.put_file("/b/f.txt", b"old", at(100)).await;

        assert_eq!(
            coordinator.scan_all().await.unwrap(),
            ScanOutcome::Ready { tasks: 1 }
        );
        let cache = coordinator.cache();
        assert!(cache.is_locked().await);
        assert!(cache.get("/a/f.txt").await.is_none());

        let entry = cache.get("/b/f.txt").await.unwrap();
        let task = entry.as_task().unwrap();
        assert_eq!(task.source, "/a/f.txt");
        assert_eq!(task.status, TaskStatus::Init);

        assert!(matches!(
            coordinator.scan_all().await,
            Err(SyncError::CacheLocked)
        ));
    }

    #[tokio::test]
    async fn test_nothing_to_sync_is_not_an_error() {
        let (remote, coordinator) = coordinator().await;
        remote.put_file("/a/f.txt", b"x", at(0)).await;
        remote.put_file("/b/f.txt", b"x", at(0)).await;

        assert_eq!(
            coordinator.scan_all().await.unwrap(),
            ScanOutcome::NothingToSync
        );
        assert!(!coordinator.cache().is_locked().await);

        let (_tx, rx) = watch::channel(false);
        coordinator.cache().finish_pass().await.unwrap();
        assert_eq!(coordinator.run(rx).await.unwrap(), RunReport::NothingToSync);
        assert!(coordinator.status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_propagates_and_closes_pass() {
        let (remote, coordinator) = coordinator().await;
        remote.put_file("/a/f.txt", b"newer", at(200)).await;
        remote.put_file("/b/f.txt", b"old", at(100)).await;
        remote.put_file("/a/only/here.md", b"# hi", at(50)).await;
        remote.set_transfer_delay(2).await;

        let (_tx, rx) = watch::channel(false);
        let report = coordinator.run(rx).await.unwrap();
        assert_eq!(report, RunReport::Completed { tasks: 2 });
        assert!(report.is_success());

        assert_eq!(remote.content("/b/f.txt").await.unwrap(), b"newer");
        assert_eq!(remote.content("/b/only/here.md").await.unwrap(), b"# hi");

        let backup = format!(
            "/b/{}/{}.txt",
            coordinator.config().backup_dir_name,
            crate::workers::backup_hash("/b/f.txt")
        );
        assert_eq!(remote.content(&backup).await.unwrap(), b"old");

        assert!(!coordinator.cache().is_locked().await);
        assert!(coordinator.status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_run_keeps_lock_and_resumes() {
        let (remote, coordinator) = coordinator().await;
        remote.put_file("/a/f.txt", b"newer", at(200)).await;
        remote.put_file("/b/f.txt", b"old", at(100)).await;
        remote.inject_failure("/b/f.txt").await;

        let (_tx, rx) = watch::channel(false);
        let report = coordinator.run(rx.clone()).await.unwrap();
        assert_eq!(
            report,
            RunReport::Incomplete {
                unfinished: vec![("/b/f.txt".to_string(), TaskStatus::Init)]
            }
        );
        assert!(!report.is_success());
        assert!(coordinator.cache().is_locked().await);

        remote.clear_failure("/b/f.txt").await;
        let report = coordinator.run(rx).await.unwrap();
        assert_eq!(report, RunReport::Completed { tasks: 1 });
        assert_eq!(remote.content("/b/f.txt").await.unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_propagate_requires_lock() {
        let (_remote, coordinator) = coordinator().await;
        coordinator
            .cache()
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            coordinator.propagate(rx).await,
            Err(SyncError::NotLocked)
        ));
    }

    #[test]
    fn test_rejects_single_item() {
        let items = ItemDirs::new(["/a"]).unwrap();
        let remote: Arc<dyn RemoteStorage> = Arc::new(MemoryRemote::new());
        assert!(matches!(
            SyncCoordinator::open(remote, items, "memory://", config()),
            Err(SyncError::Config(_))
        ));
    }
}
