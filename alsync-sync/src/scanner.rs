//! Change detection
//!
//! Walks an item directory through the remote listing and turns every file
//! into a change magnitude: the file's current modified time minus the
//! baseline frozen the first time the path was seen.

use std::sync::Arc;
use tracing::{debug, info, trace};

use alsync_remote::{list, RemoteEntry, RemoteStorage};
use alsync_store::paths::normalize;
use alsync_store::{FileRecordStore, ItemDirs, UpdateCache};

use crate::errors::Result;

/// Counters for one `scan` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub directories: usize,
    pub files: usize,
    pub skipped: usize,
}

impl ScanStats {
    fn absorb(&mut self, other: &ScanStats) {
        self.directories += other.directories;
        self.files += other.files;
        self.skipped += other.skipped;
    }
}

enum Frame {
    Enter(String),
    /// All children of this directory are done
    Finish(String),
}

pub struct Scanner {
    remote: Arc<dyn RemoteStorage>,
    records: Arc<FileRecordStore>,
    cache: Arc<UpdateCache>,
    backup_dir_name: String,
    page_size: u32,
}

impl Scanner {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        records: Arc<FileRecordStore>,
        cache: Arc<UpdateCache>,
        backup_dir_name: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            remote,
            records,
            cache,
            backup_dir_name: backup_dir_name.into(),
            page_size,
        }
    }

    /// Scan `dir` and everything below it.
    ///
    /// Directories that already carry a scanned marker are not listed again,
    /// so a repeated call within one pass changes nothing.
    pub async fn scan(&self, dir: &str) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut stack = vec![Frame::Enter(normalize(dir)?)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(dir) => {
                    if self.cache.is_scanned(&dir).await {
                        trace!("{} already scanned", dir);
                        continue;
                    }
                    stack.push(Frame::Finish(dir.clone()));

                    let subdirs = self.list_dir(&dir, &mut stats).await?;
                    stack.extend(subdirs.into_iter().rev().map(Frame::Enter));
                }
                Frame::Finish(dir) => {
                    self.cache.mark_scanned(&dir).await?;
                    stats.directories += 1;
                    trace!("Marked {} scanned", dir);
                }
            }
        }

        debug!("Scanned {}: {:?}", dir, stats);
        Ok(stats)
    }

    /// Scan every item directory in configuration order
    pub async fn scan_items(&self, item_dirs: &ItemDirs) -> Result<ScanStats> {
        let mut total = ScanStats::default();
        for item in item_dirs.iter() {
            let stats = self.scan(item).await?;
            info!(
                "Scanned item {}: {} directories, {} files, {} skipped",
                item, stats.directories, stats.files, stats.skipped
            );
            total.absorb(&stats);
        }
        Ok(total)
    }

    /// Record every file in `dir` and return its sub-directories
    async fn list_dir(&self, dir: &str, stats: &mut ScanStats) -> Result<Vec<String>> {
        let mut listing = list(&self.remote, dir, self.page_size);
        let mut subdirs = Vec::new();

        while let Some(entry) = listing.next().await? {
            let path = ItemDirs::join(dir, &entry.name);

            if entry.name == self.backup_dir_name {
                stats.skipped += 1;
                continue;
            }

            if entry.is_dir {
                subdirs.push(path);
                continue;
            }

            if self.cache.get(&path).await.is_some() {
                stats.skipped += 1;
                continue;
            }

            self.record_file(&path, &entry).await?;
            stats.files += 1;
        }

        Ok(subdirs)
    }

    async fn record_file(&self, path: &str, entry: &RemoteEntry) -> Result<()> {
        let modified = entry.modified_timestamp().unwrap_or(0).max(0);

        let baseline = match self.records.get(path).await {
            Some(record) => record.modified.unwrap_or(0),
            None => {
                self.records
                    .record_baseline(path, modified, entry.size.max(0))
                    .await?;
                0
            }
        };

        let magnitude = modified - baseline;
        self.cache.set_magnitude(path, magnitude).await?;
        trace!("{}: modified {} baseline {} -> {}", path, modified, baseline, magnitude);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alsync_remote::MemoryRemote;
    use alsync_store::CacheEntry;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn setup() -> (Arc<MemoryRemote>, Scanner, Arc<UpdateCache>, Arc<FileRecordStore>) {
        let items = ItemDirs::new(["/a", "/b"]).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let records = Arc::new(FileRecordStore::open("memory://", items.clone()).unwrap());
        let cache = Arc::new(UpdateCache::open("memory://", items).unwrap());
        let scanner = Scanner::new(
            remote.clone(),
            records.clone(),
            cache.clone(),
            ".backup",
            2,
        );
        (remote, scanner, cache, records)
    }

    #[tokio::test]
    async fn test_scan_records_baselines_and_magnitudes() {
        let (remote, scanner, cache, records) = setup().await;
        remote.put_file("/a/f.txt", b"hello", at(200)).await;
        remote.put_file("/a/sub/deep/g.txt", b"g", at(50)).await;
        remote.put_file("/a/.backup/old.txt", b"o", at(10)).await;

        let stats = scanner.scan("/a").await.unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 3);
        assert_eq!(stats.skipped, 1);

        assert_eq!(cache.get("/a/f.txt").await, Some(CacheEntry::Magnitude(200)));
        assert_eq!(
            cache.get("/a/sub/deep/g.txt").await,
            Some(CacheEntry::Magnitude(50))
        );
        assert!(cache.get("/a/.backup/old.txt").await.is_none());
        assert!(cache.is_scanned("/a").await);
        assert!(cache.is_scanned("/a/sub/deep").await);

        let record = records.get("/a/f.txt").await.unwrap();
        assert_eq!(record.modified, Some(200));
        assert_eq!(record.size, Some(5));
    }

    #[tokio::test]
    async fn test_repeated_scan_is_idempotent() {
        let (remote, scanner, cache, _records) = setup().await;
        remote.put_file("/a/f.txt", b"x", at(200)).await;
        remote.put_file("/a/d/g.txt", b"y", at(300)).await;

        scanner.scan("/a").await.unwrap();
        let first = cache.store().full_paths().await.unwrap();

        remote.put_file("/a/new.txt", b"z", at(400)).await;
        let stats = scanner.scan("/a").await.unwrap();
        assert_eq!(stats, ScanStats::default());
        assert_eq!(cache.store().full_paths().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_baseline_is_frozen_across_passes() {
        let (remote, scanner, cache, records) = setup().await;
        remote.put_file("/a/f.txt", b"x", at(200)).await;
        scanner.scan("/a").await.unwrap();

        cache.finish_pass().await.unwrap();
        remote.put_file("/a/f.txt", b"xy", at(260)).await;
        scanner.scan("/a").await.unwrap();

        assert_eq!(cache.get("/a/f.txt").await, Some(CacheEntry::Magnitude(60)));
        assert_eq!(records.get("/a/f.txt").await.unwrap().modified, Some(200));
    }

    #[tokio::test]
    async fn test_missing_item_directory_fails() {
        let (_remote, scanner, _cache, _records) = setup().await;
        assert!(scanner.scan("/a").await.is_err());
    }
}
