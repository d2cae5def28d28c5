//! Propagation workers
//!
//! Each phase has a driver that starts remote operations for every task in
//! the phase's pending state, and a verifier that polls the remote until the
//! started operations are observable. The two only communicate through the
//! update cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use alsync_remote::{list, RemoteEntry, RemoteStorage};
use alsync_store::paths::{file_name, parent, suffix};
use alsync_store::{BackupInfo, ItemDirs, SyncTask, TaskStatus, UpdateCache};

use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Move the stale target aside
    Backup,
    /// Copy the source over
    Copy,
}

impl Phase {
    /// State the driver picks tasks from
    pub fn pending(self) -> TaskStatus {
        match self {
            Phase::Backup => TaskStatus::Init,
            Phase::Copy => TaskStatus::MovedOld,
        }
    }

    /// State the verifier polls
    pub fn in_flight(self) -> TaskStatus {
        match self {
            Phase::Backup => TaskStatus::MovingOld,
            Phase::Copy => TaskStatus::CopyingNew,
        }
    }

    /// State a confirmed task moves to
    pub fn confirmed(self) -> TaskStatus {
        match self {
            Phase::Backup => TaskStatus::MovedOld,
            Phase::Copy => TaskStatus::CopiedNew,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub started: usize,
    pub failed: usize,
    pub verified: usize,
    /// Tasks still in flight when the verifier gave up
    pub stalled: Vec<String>,
    pub cancelled: bool,
}

/// Stable backup identifier of a target path
pub fn backup_hash(target: &str) -> String {
    blake3::hash(target.as_bytes()).to_hex().to_string()
}

/// Sidecar metadata file next to a backup
pub fn sidecar_path(backup_path: &str) -> String {
    format!("{}.json", backup_path)
}

/// First `<stem>.<n><ext>` in `dir_names` that is free along with its sidecar
fn free_name(stem: &str, ext: &str, dir_names: &HashSet<String>) -> String {
    let mut n: u32 = 1;
    loop {
        let name = format!("{}.{}{}", stem, n, ext);
        if !dir_names.contains(&name) && !dir_names.contains(&sidecar_path(&name)) {
            return name;
        }
        n += 1;
    }
}

fn backup_info(target: &str, entry: &RemoteEntry) -> BackupInfo {
    BackupInfo {
        name: entry.name.clone(),
        size: Some(entry.size),
        modified: entry.modified.clone(),
        sign: entry.sign.clone(),
        kind: entry.kind,
        provider: entry.provider.clone(),
        path: target.to_string(),
        hash: backup_hash(target),
    }
}

/// Flags the driver as finished even when it unwinds
struct DoneOnDrop(Arc<AtomicBool>);

impl Drop for DoneOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Sleep for one poll interval. Returns `true` when shutdown was requested.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => match changed {
            Ok(()) => *shutdown.borrow(),
            // Sender gone, nobody can ask us to stop any more
            Err(_) => {
                tokio::time::sleep(interval).await;
                false
            }
        },
    }
}

#[derive(Clone)]
pub struct Worker {
    remote: Arc<dyn RemoteStorage>,
    cache: Arc<UpdateCache>,
    config: Arc<SyncConfig>,
}

impl Worker {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        cache: Arc<UpdateCache>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            remote,
            cache,
            config,
        }
    }

    /// Full path of the backup for `target`
    pub fn backup_location(&self, target: &str, hash: &str) -> Result<String> {
        let (item, _) = self.cache.item_dirs().decompose(target)?;
        let backup_dir = ItemDirs::join(&item, &self.config.backup_dir_name);
        Ok(ItemDirs::join(
            &backup_dir,
            &format!("{}{}", hash, suffix(target)),
        ))
    }

    /// Create the backup directory under every item
    pub async fn ensure_backup_dirs(&self) -> Result<()> {
        for item in self.cache.item_dirs().iter() {
            let dir = ItemDirs::join(item, &self.config.backup_dir_name);
            self.remote.make_dir(&dir).await?;
            debug!("Backup directory ready: {}", dir);
        }
        Ok(())
    }

    /// Start the remote operation for every task pending in `phase`.
    ///
    /// A failing task is logged and left where it was.
    pub async fn drive(
        &self,
        phase: Phase,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PhaseReport> {
        let mut report = PhaseReport::default();

        for (path, task) in self.cache.tasks_in(phase.pending()).await? {
            if *shutdown.borrow() {
                report.cancelled = true;
                break;
            }

            let result = match phase {
                Phase::Backup => self.backup_old(&path, &task).await,
                Phase::Copy => self.copy_new(&path, &task).await,
            };

            match result {
                Ok(status) => {
                    report.started += 1;
                    debug!("{}: {:?} step started, now {}", path, phase, status);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "{:?} step failed for {}, task stays in {}: {}",
                        phase,
                        path,
                        phase.pending(),
                        e
                    );
                }
            }
        }

        Ok(report)
    }

    /// Poll tasks in flight for `phase` until the driver is done and none
    /// remain, the attempt budget runs out, or shutdown is requested.
    ///
    /// Only polls made after the driver finished count against the budget.
    pub async fn verify(
        &self,
        phase: Phase,
        producer_done: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PhaseReport> {
        let mut report = PhaseReport::default();
        let mut attempts: u32 = 0;

        loop {
            let done = producer_done.load(Ordering::Acquire);

            for (path, task) in self.cache.tasks_in(phase.in_flight()).await? {
                let checked = match phase {
                    Phase::Backup => self.verify_backup(&path, &task).await,
                    Phase::Copy => self.verify_copy(&path, &task).await,
                };
                match checked {
                    Ok(true) => report.verified += 1,
                    Ok(false) => {}
                    Err(SyncError::Remote(e)) => debug!("{} not confirmed yet: {}", path, e),
                    Err(e) => warn!("Verification of {} failed: {}", path, e),
                }
            }

            let remaining: Vec<String> = self
                .cache
                .tasks_in(phase.in_flight())
                .await?
                .into_iter()
                .map(|(path, _)| path)
                .collect();
            if done && remaining.is_empty() {
                break;
            }

            if done {
                attempts += 1;
            }
            if let Some(max) = self.config.max_poll_attempts {
                if attempts >= max {
                    warn!(
                        "Giving up on {} task(s) still {} after {} polls",
                        remaining.len(),
                        phase.in_flight(),
                        attempts
                    );
                    report.stalled = remaining;
                    break;
                }
            }

            if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                info!("{:?} verification interrupted by shutdown", phase);
                report.cancelled = true;
                report.stalled = remaining;
                break;
            }
        }

        Ok(report)
    }

    /// Names currently listed in `dir`
    async fn names_in(&self, dir: &str) -> Result<HashSet<String>> {
        match list(&self.remote, dir, self.config.page_size).collect().await {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.name).collect()),
            Err(e) if e.is_not_found() => Ok(HashSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the way for a new backup at `location`.
    ///
    /// A backup left there by an earlier pass is renamed to the next free
    /// `<hash>.<n><suffix>` together with its sidecar. An entry named like the
    /// target sitting un-renamed in the backup directory is renamed the same
    /// way, since the move would otherwise replace it.
    async fn retire_previous(&self, target: &str, location: &str) -> Result<()> {
        let backup_dir = parent(location);
        let mut dir_names = self.names_in(backup_dir).await?;

        let current = file_name(location);
        if dir_names.contains(current) {
            let ext = suffix(location);
            let stem = &current[..current.len() - ext.len()];
            let rotated = free_name(stem, ext, &dir_names);
            self.remote
                .rename(&ItemDirs::join(backup_dir, current), &rotated)
                .await?;

            let sidecar = sidecar_path(current);
            if dir_names.contains(&sidecar) {
                self.remote
                    .rename(&ItemDirs::join(backup_dir, &sidecar), &sidecar_path(&rotated))
                    .await?;
                dir_names.insert(sidecar_path(&rotated));
            }
            info!("Previous backup of {} kept as {}", target, rotated);
            dir_names.insert(rotated);
        }

        let name = file_name(target);
        if dir_names.contains(name) {
            let ext = suffix(target);
            let stray = free_name(&name[..name.len() - ext.len()], ext, &dir_names);
            self.remote
                .rename(&ItemDirs::join(backup_dir, name), &stray)
                .await?;
            warn!("Un-renamed {} found in {}, kept as {}", name, backup_dir, stray);
        }
        Ok(())
    }

    /// Init: move the current target into the backup directory
    async fn backup_old(&self, target: &str, task: &SyncTask) -> Result<TaskStatus> {
        let entry = match self.remote.get_metadata(target).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return self.resume_backup(target, task).await,
            Err(e) => return Err(e.into()),
        };

        let info = backup_info(target, &entry);
        let location = self.backup_location(target, &info.hash)?;
        self.retire_previous(target, &location).await?;
        self.cache.set_backup_info(target, info).await?;

        let name = file_name(target);
        let backup_dir = parent(&location);
        self.remote
            .move_entry(parent(target), backup_dir, &[name.to_string()])
            .await?;
        self.remote
            .rename(&ItemDirs::join(backup_dir, name), file_name(&location))
            .await?;

        self.cache
            .advance(target, TaskStatus::Init, TaskStatus::MovingOld)
            .await?;
        info!("Moving {} to {}", target, location);
        Ok(TaskStatus::MovingOld)
    }

    /// Init with the target gone: either nothing to back up, or an earlier
    /// attempt moved it and did not get to the rename
    async fn resume_backup(&self, target: &str, task: &SyncTask) -> Result<TaskStatus> {
        if let Some(info) = &task.target_old_info {
            let location = self.backup_location(target, &info.hash)?;
            let moved = ItemDirs::join(parent(&location), file_name(target));

            let pending_rename = match self.remote.get_metadata(&moved).await {
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e.into()),
            };
            if pending_rename {
                self.remote.rename(&moved, file_name(&location)).await?;
                info!("Finished interrupted backup of {} at {}", target, location);
            }

            let landed = pending_rename
                || match self.remote.get_metadata(&location).await {
                    Ok(_) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e.into()),
                };
            if landed {
                self.cache
                    .advance(target, TaskStatus::Init, TaskStatus::MovingOld)
                    .await?;
                return Ok(TaskStatus::MovingOld);
            }
        }

        self.cache
            .advance(target, TaskStatus::Init, TaskStatus::MovedOld)
            .await?;
        info!("{} does not exist yet, nothing to back up", target);
        Ok(TaskStatus::MovedOld)
    }

    /// MovingOld: confirm the backup landed and write its sidecar
    async fn verify_backup(&self, target: &str, task: &SyncTask) -> Result<bool> {
        let info = task
            .target_old_info
            .as_ref()
            .ok_or_else(|| SyncError::MissingBackupInfo(target.to_string()))?;
        let location = self.backup_location(target, &info.hash)?;

        let entry = match self.remote.get_metadata(&location).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if info.size.map_or(false, |size| size != entry.size) {
            debug!("{} visible but not yet the backup of {}", location, target);
            return Ok(false);
        }

        let sidecar = sidecar_path(&location);
        self.remote
            .create_file(&sidecar, serde_json::to_vec_pretty(info)?)
            .await?;

        let advanced = self
            .cache
            .advance(target, TaskStatus::MovingOld, TaskStatus::MovedOld)
            .await?;
        if advanced {
            info!("Backup of {} confirmed at {}", target, location);
        }
        Ok(advanced)
    }

    /// MovedOld: copy the source into the target's directory
    async fn copy_new(&self, target: &str, task: &SyncTask) -> Result<TaskStatus> {
        let source = self.remote.get_metadata(&task.source).await?;
        let target_dir = parent(target);

        self.remote.make_dir(target_dir).await?;
        self.cache
            .set_source_size(target, (!source.is_dir).then_some(source.size))
            .await?;
        self.remote
            .copy(
                parent(&task.source),
                target_dir,
                &[file_name(&task.source).to_string()],
            )
            .await?;

        self.cache
            .advance(target, TaskStatus::MovedOld, TaskStatus::CopyingNew)
            .await?;
        info!("Copying {} to {}", task.source, target);
        Ok(TaskStatus::CopyingNew)
    }

    /// CopyingNew: the copy is done once the target is visible with the
    /// source's size
    async fn verify_copy(&self, target: &str, task: &SyncTask) -> Result<bool> {
        let entry = match self.remote.get_metadata(target).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if let Some(expected) = task.source_size {
            if entry.size != expected {
                debug!(
                    "{} visible but size {} != {}, copy still running",
                    target, entry.size, expected
                );
                return Ok(false);
            }
        }

        let advanced = self
            .cache
            .advance(target, TaskStatus::CopyingNew, TaskStatus::CopiedNew)
            .await?;
        if advanced {
            info!("Copy to {} confirmed", target);
        }
        Ok(advanced)
    }

    /// CopiedNew: mark every copied task terminal
    pub async fn finalize(&self) -> Result<usize> {
        let end = serde_json::to_value(TaskStatus::End)?;
        let mut finalized = 0;
        for (path, _) in self.cache.tasks_in(TaskStatus::CopiedNew).await? {
            self.cache
                .update_status(&path, "status", end.clone())
                .await?;
            finalized += 1;
        }
        if finalized > 0 {
            info!("Finalized {} task(s)", finalized);
        }
        Ok(finalized)
    }

    /// Run the driver and verifier of `phase` side by side
    pub async fn run_phase(
        &self,
        phase: Phase,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PhaseReport> {
        let done = Arc::new(AtomicBool::new(false));

        let driver = {
            let worker = self.clone();
            let done = Arc::clone(&done);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _done = DoneOnDrop(done);
                worker.drive(phase, &shutdown).await
            })
        };

        let verifier = {
            let worker = self.clone();
            tokio::spawn(async move { worker.verify(phase, done, shutdown).await })
        };

        let (driven, verified) = tokio::join!(driver, verifier);
        let driven = driven.map_err(|e| SyncError::Worker(e.to_string()))??;
        let verified = verified.map_err(|e| SyncError::Worker(e.to_string()))??;

        let report = PhaseReport {
            started: driven.started,
            failed: driven.failed,
            verified: verified.verified,
            stalled: verified.stalled,
            cancelled: driven.cancelled || verified.cancelled,
        };
        info!(
            "{:?} phase: {} started, {} failed, {} confirmed as {}, {} stalled",
            phase,
            report.started,
            report.failed,
            report.verified,
            phase.confirmed(),
            report.stalled.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alsync_remote::MemoryRemote;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Fixture {
        remote: Arc<MemoryRemote>,
        cache: Arc<UpdateCache>,
        worker: Worker,
        _shutdown_tx: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
    }

    async fn fixture(max_poll_attempts: Option<u32>) -> Fixture {
        let items = ItemDirs::new(["/a", "/b"]).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.put_dir("/a").await;
        remote.put_dir("/b").await;
        let cache = Arc::new(UpdateCache::open("memory://", items).unwrap());
        let config = Arc::new(SyncConfig {
            backup_dir_name: ".backup".to_string(),
            poll_interval: Duration::from_millis(5),
            max_poll_attempts,
            ..SyncConfig::default()
        });
        let worker = Worker::new(remote.clone(), cache.clone(), config);
        worker.ensure_backup_dirs().await.unwrap();
        let (tx, rx) = watch::channel(false);
        Fixture {
            remote,
            cache,
            worker,
            _shutdown_tx: tx,
            shutdown: rx,
        }
    }

    async fn status_of(cache: &UpdateCache, path: &str) -> TaskStatus {
        cache.get(path).await.unwrap().as_task().unwrap().status
    }

    #[test]
    fn test_backup_naming() {
        let hash = backup_hash("/b/docs/f.txt");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, backup_hash("/b/docs/f.txt"));
        assert_ne!(hash, backup_hash("/a/docs/f.txt"));
        assert_eq!(sidecar_path("/b/.backup/x.json"), "/b/.backup/x.json.json");

        let taken: HashSet<String> = ["h.txt", "h.1.txt", "h.2.txt.json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(free_name("h", ".txt", &taken), "h.3.txt");
    }

    #[tokio::test]
    async fn test_backup_of_absent_target_skips_to_moved_old() {
        let f = fixture(Some(50)).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();
        f.cache.lock().await.unwrap();

        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.verified, 0);
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::MovedOld);
        assert!(f.cache.is_locked().await);
    }

    #[tokio::test]
    async fn test_backup_waits_for_moved_file_and_writes_sidecar() {
        let f = fixture(Some(50)).await;
        f.remote.put_file("/b/f.txt", b"stale", at(100)).await;
        f.remote.set_transfer_delay(3).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();
        f.cache.lock().await.unwrap();

        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.verified, 1);
        assert!(report.stalled.is_empty());

        let entry = f.cache.get("/b/f.txt").await.unwrap();
        let task = entry.as_task().unwrap();
        assert_eq!(task.status, TaskStatus::MovedOld);
        let info = task.target_old_info.clone().unwrap();
        assert_eq!(info.name, "f.txt");
        assert_eq!(info.size, Some(5));
        assert_eq!(info.path, "/b/f.txt");

        let location = format!("/b/.backup/{}.txt", backup_hash("/b/f.txt"));
        assert_eq!(f.remote.content(&location).await.unwrap(), b"stale");
        assert!(f.remote.entry("/b/f.txt").await.is_none());

        let sidecar = f.remote.content(&sidecar_path(&location)).await.unwrap();
        let stored: BackupInfo = serde_json::from_slice(&sidecar).unwrap();
        assert_eq!(stored, info);
    }

    #[tokio::test]
    async fn test_existing_backup_is_rotated_with_its_sidecar() {
        let f = fixture(Some(50)).await;
        let location = format!("/b/.backup/{}.txt", backup_hash("/b/f.txt"));
        let rotated = format!("/b/.backup/{}.1.txt", backup_hash("/b/f.txt"));

        f.remote.put_file("/b/f.txt", b"first", at(100)).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();
        f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(f.remote.content(&location).await.unwrap(), b"first");

        // Same target backed up again in a later pass, with a slow service
        f.remote.put_file("/b/f.txt", b"second!", at(300)).await;
        f.remote.set_transfer_delay(2).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();
        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.verified, 1);
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::MovedOld);

        assert_eq!(f.remote.content(&location).await.unwrap(), b"second!");
        assert_eq!(f.remote.content(&rotated).await.unwrap(), b"first");
        assert!(f.remote.entry("/b/.backup/f.txt").await.is_none());

        let current: BackupInfo =
            serde_json::from_slice(&f.remote.content(&sidecar_path(&location)).await.unwrap())
                .unwrap();
        assert_eq!(current.size, Some(7));
        let previous: BackupInfo =
            serde_json::from_slice(&f.remote.content(&sidecar_path(&rotated)).await.unwrap())
                .unwrap();
        assert_eq!(previous.size, Some(5));
    }

    #[tokio::test]
    async fn test_interrupted_rename_is_finished_on_resume() {
        let f = fixture(Some(50)).await;
        // Moved into the backup directory, rename never happened
        f.remote.put_file("/b/.backup/f.txt", b"stale", at(100)).await;
        let mut task = SyncTask::new("/a/f.txt");
        task.target_old_info = Some(backup_info(
            "/b/f.txt",
            &RemoteEntry::file("f.txt", 5, at(100)),
        ));
        f.cache.create_task("/b/f.txt", task).await.unwrap();
        f.cache.lock().await.unwrap();

        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.verified, 1);
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::MovedOld);

        let location = format!("/b/.backup/{}.txt", backup_hash("/b/f.txt"));
        assert_eq!(f.remote.content(&location).await.unwrap(), b"stale");
        assert!(f.remote.entry("/b/.backup/f.txt").await.is_none());
        assert!(f.remote.entry(&sidecar_path(&location)).await.is_some());
    }

    #[tokio::test]
    async fn test_stray_entry_in_backup_dir_is_not_overwritten() {
        let f = fixture(Some(50)).await;
        f.remote.put_file("/b/.backup/f.txt", b"orphan", at(50)).await;
        f.remote.put_file("/b/f.txt", b"stale", at(100)).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();

        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.verified, 1);

        let location = format!("/b/.backup/{}.txt", backup_hash("/b/f.txt"));
        assert_eq!(f.remote.content(&location).await.unwrap(), b"stale");
        assert_eq!(f.remote.content("/b/.backup/f.1.txt").await.unwrap(), b"orphan");
    }

    #[tokio::test]
    async fn test_failed_backup_stays_in_init() {
        let f = fixture(Some(50)).await;
        f.remote.put_file("/b/f.txt", b"stale", at(100)).await;
        f.remote.inject_failure("/b/f.txt").await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();

        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::Init);
        assert!(f.remote.entry("/b/f.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_copy_phase_and_finalize() {
        let f = fixture(Some(50)).await;
        f.remote.put_file("/a/docs/f.txt", b"fresh", at(200)).await;
        f.remote.set_transfer_delay(2).await;

        let mut task = SyncTask::new("/a/docs/f.txt");
        task.status = TaskStatus::MovedOld;
        f.cache.create_task("/b/docs/f.txt", task).await.unwrap();
        f.cache.lock().await.unwrap();

        let report = f.worker.run_phase(Phase::Copy, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.verified, 1);
        assert_eq!(status_of(&f.cache, "/b/docs/f.txt").await, TaskStatus::CopiedNew);
        assert_eq!(f.remote.content("/b/docs/f.txt").await.unwrap(), b"fresh");

        let entry = f.cache.get("/b/docs/f.txt").await.unwrap();
        assert_eq!(entry.as_task().unwrap().source_size, Some(5));

        assert_eq!(f.worker.finalize().await.unwrap(), 1);
        assert_eq!(status_of(&f.cache, "/b/docs/f.txt").await, TaskStatus::End);
        assert!(f.cache.is_locked().await);
    }

    #[tokio::test]
    async fn test_repeated_polling_never_regresses() {
        let f = fixture(Some(50)).await;
        f.remote.put_file("/b/f.txt", b"stale", at(100)).await;
        f.cache
            .create_task("/b/f.txt", SyncTask::new("/a/f.txt"))
            .await
            .unwrap();

        f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::MovedOld);

        // A second round finds nothing pending or in flight
        let report = f.worker.run_phase(Phase::Backup, f.shutdown.clone()).await.unwrap();
        assert_eq!(report, PhaseReport::default());
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::MovedOld);
    }

    #[tokio::test]
    async fn test_verifier_gives_up_after_attempt_budget() {
        let f = fixture(Some(3)).await;
        f.remote.put_file("/a/f.txt", b"fresh", at(200)).await;
        f.remote.set_transfer_delay(1_000).await;

        let mut task = SyncTask::new("/a/f.txt");
        task.status = TaskStatus::MovedOld;
        f.cache.create_task("/b/f.txt", task).await.unwrap();

        let report = f.worker.run_phase(Phase::Copy, f.shutdown.clone()).await.unwrap();
        assert_eq!(report.stalled, vec!["/b/f.txt".to_string()]);
        assert_eq!(status_of(&f.cache, "/b/f.txt").await, TaskStatus::CopyingNew);
    }

    #[tokio::test]
    async fn test_shutdown_stops_verifier() {
        let f = fixture(None).await;
        f.remote.put_file("/a/f.txt", b"fresh", at(200)).await;
        f.remote.set_transfer_delay(1_000).await;

        let mut task = SyncTask::new("/a/f.txt");
        task.status = TaskStatus::CopyingNew;
        f.cache.create_task("/b/f.txt", task).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let done = Arc::new(AtomicBool::new(true));
        let worker = f.worker.clone();
        let handle = tokio::spawn(async move { worker.verify(Phase::Copy, done, rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.stalled, vec!["/b/f.txt".to_string()]);
    }
}
