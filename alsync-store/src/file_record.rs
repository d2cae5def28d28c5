//! Baseline file metadata
//!
//! A record is written the first time a path is observed and is never
//! refreshed by the scanner afterwards. The recorded modified time is the
//! baseline that change magnitudes are measured from.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::errors::Result;
use crate::paths::ItemDirs;
use crate::store::{open_store, PathStore, StoreValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Epoch seconds
    pub modified: Option<i64>,
    pub size: Option<i64>,
}

impl StoreValue for FileRecord {
    fn verify(&self, _existing: Option<&Self>) -> bool {
        self.modified.map_or(true, |m| m >= 0) && self.size.map_or(true, |s| s >= 0)
    }
}

pub struct FileRecordStore {
    store: Arc<dyn PathStore<FileRecord>>,
}

impl FileRecordStore {
    pub const NAME: &'static str = "file_record";

    pub fn open(uri: &str, item_dirs: ItemDirs) -> Result<Self> {
        Ok(Self::new(open_store(uri, item_dirs, Self::NAME)?))
    }

    pub fn new(store: Arc<dyn PathStore<FileRecord>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PathStore<FileRecord>> {
        &self.store
    }

    pub async fn get(&self, path: &str) -> Option<FileRecord> {
        self.store.search(path).await
    }

    /// Freeze the baseline for `path`
    pub async fn record_baseline(&self, path: &str, modified: i64, size: i64) -> Result<()> {
        let record = FileRecord {
            modified: Some(modified),
            size: Some(size),
        };
        self.store.create(path, record).await?;
        debug!("Recorded baseline for {}: {:?}", path, record);
        Ok(())
    }

    /// Baseline modified time, 0 when the path was never recorded
    pub async fn baseline_modified(&self, path: &str) -> i64 {
        self.get(path)
            .await
            .and_then(|record| record.modified)
            .unwrap_or(0)
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;

    #[tokio::test]
    async fn test_record_and_read_baseline() {
        let records =
            FileRecordStore::open("memory://", ItemDirs::new(["/a", "/b"]).unwrap()).unwrap();
        assert_eq!(records.get("/a/f.txt").await, None);
        assert_eq!(records.baseline_modified("/a/f.txt").await, 0);

        records.record_baseline("/a/f.txt", 200, 12).await.unwrap();
        assert_eq!(
            records.get("/a/f.txt").await,
            Some(FileRecord {
                modified: Some(200),
                size: Some(12)
            })
        );
        assert_eq!(records.baseline_modified("/a/f.txt").await, 200);
    }

    #[tokio::test]
    async fn test_negative_values_rejected() {
        let records =
            FileRecordStore::open("memory://", ItemDirs::new(["/a", "/b"]).unwrap()).unwrap();
        assert!(matches!(
            records.record_baseline("/a/f.txt", -5, 1).await,
            Err(StoreError::Validation(_))
        ));
        assert!(FileRecord {
            modified: None,
            size: None
        }
        .verify(None));
    }
}
