//! Shared fixtures for integration tests

#![allow(dead_code)]

use alsync::remote::{MemoryRemote, RemoteStorage};
use alsync::store::ItemDirs;
use alsync::sync::{SyncConfig, SyncCoordinator};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(5),
        max_poll_attempts: Some(200),
        flush_interval: Duration::from_millis(20),
        ..SyncConfig::default()
    }
}

pub fn items() -> ItemDirs {
    ItemDirs::new(["/a", "/b"]).unwrap()
}

/// Remote holding both item directories, empty
pub async fn remote() -> Arc<MemoryRemote> {
    let remote = Arc::new(MemoryRemote::new());
    remote.put_dir("/a").await;
    remote.put_dir("/b").await;
    remote
}

pub fn coordinator(remote: &Arc<MemoryRemote>, cache_uri: &str) -> SyncCoordinator {
    let remote: Arc<dyn RemoteStorage> = remote.clone();
    SyncCoordinator::open(remote, items(), cache_uri, fast_config()).unwrap()
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("alsync=debug,alsync_sync=debug,alsync_store=debug")
        .with_test_writer()
        .try_init();
}
