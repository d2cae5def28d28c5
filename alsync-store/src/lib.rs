//! Path-keyed persistent stores shared by the sync coordinator

pub mod errors;
pub mod file_record;
pub mod json_store;
pub mod paths;
pub mod sqlite_store;
pub mod store;
pub mod updating_cache;

pub use errors::{Result, StoreError};
pub use file_record::{FileRecord, FileRecordStore};
pub use json_store::JsonPathStore;
pub use paths::ItemDirs;
pub use sqlite_store::SqlitePathStore;
pub use store::{open_store, spawn_flush_task, PathStore, StoreUri, StoreValue};
pub use updating_cache::{
    BackupInfo, CacheEntry, PassSummary, SyncTask, TaskStatus, UpdateCache,
};
