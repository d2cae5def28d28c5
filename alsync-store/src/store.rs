//! The path-keyed store contract and back-end selection

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::json_store::JsonPathStore;
use crate::paths::ItemDirs;
use crate::sqlite_store::SqlitePathStore;

/// A value that can live in a [`PathStore`].
///
/// `verify` is the consumer-specific validator consulted by every
/// `update`/`create`. `existing` is the value currently stored at the path.
pub trait StoreValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn verify(&self, existing: Option<&Self>) -> bool;
}

/// Path-keyed persistent key/value store with a global advisory lock.
///
/// All paths are full paths under one of the configured item directories.
/// While locked, `update`, `create` and `delete` fail with
/// [`StoreError::Locked`]; reads and enumeration keep working.
#[async_trait]
pub trait PathStore<V: StoreValue>: Send + Sync {
    /// Configured item directories
    fn item_dirs(&self) -> &ItemDirs;

    /// Look up a path, falling back to a raw top-level key when the path is
    /// not under any item directory
    async fn search(&self, path: &str) -> Option<V>;

    /// Validate and write a value, replacing any previous one
    async fn update(&self, path: &str, value: V) -> Result<()>;

    /// Alias of `update`; creation and update are indistinguishable
    async fn create(&self, path: &str, value: V) -> Result<()> {
        self.update(path, value).await
    }

    /// Remove a path; missing keys are not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Snapshot of the sub-paths stored under one item directory
    async fn sub_paths(&self, item_dir: &str) -> Result<Vec<String>>;

    /// Snapshot of every `(full_path, value)` pair, in item order
    async fn full_paths(&self) -> Result<Vec<(String, V)>>;

    async fn lock(&self) -> Result<()>;

    async fn unlock(&self) -> Result<()>;

    async fn is_locked(&self) -> bool;

    /// Persist pending changes. Back-ends that write through make this a no-op.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Human readable back-end description for logs
    fn describe(&self) -> String;

    /// Sorted union of sub-paths across every item directory
    async fn all_sub_paths(&self) -> Result<Vec<String>> {
        let mut all = std::collections::BTreeSet::new();
        for item in self.item_dirs().iter() {
            all.extend(self.sub_paths(item).await?);
        }
        Ok(all.into_iter().collect())
    }

    /// Full paths only
    async fn full_path_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .full_paths()
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }
}

/// Parsed store location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    /// `json:///path/to/file.json`
    Json(PathBuf),
    /// `sqlite:///path/to/file.db`
    Sqlite(PathBuf),
    /// `memory://`
    Memory,
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUri(uri.to_string()))?;

        match scheme.to_ascii_lowercase().as_str() {
            "json" if !rest.is_empty() => Ok(Self::Json(PathBuf::from(rest))),
            "sqlite" if !rest.is_empty() => Ok(Self::Sqlite(PathBuf::from(rest))),
            "memory" => Ok(Self::Memory),
            _ => Err(StoreError::InvalidUri(uri.to_string())),
        }
    }

    /// Per-consumer variant of this location.
    ///
    /// JSON files get `_<name>` appended to their stem so several consumers
    /// can share one configured path. SQLite consumers share the database
    /// and are separated by table name instead.
    pub fn for_consumer(&self, name: &str) -> Self {
        match self {
            Self::Json(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let file_name = match path.extension() {
                    Some(ext) => format!("{}_{}.{}", stem, name, ext.to_string_lossy()),
                    None => format!("{}_{}", stem, name),
                };
                Self::Json(path.with_file_name(file_name))
            }
            other => other.clone(),
        }
    }
}

/// Open the back-end selected by `uri` for one consumer
pub fn open_store<V: StoreValue>(
    uri: &str,
    item_dirs: ItemDirs,
    name: &str,
) -> Result<Arc<dyn PathStore<V>>> {
    let parsed = StoreUri::parse(uri)?.for_consumer(name);
    info!("Opening {} store at {:?}", name, parsed);

    let store: Arc<dyn PathStore<V>> = match parsed {
        StoreUri::Json(path) => Arc::new(JsonPathStore::open(path, item_dirs)?),
        StoreUri::Sqlite(path) => Arc::new(SqlitePathStore::open(path, name, item_dirs)?),
        StoreUri::Memory => Arc::new(JsonPathStore::in_memory(item_dirs)),
    };
    Ok(store)
}

/// Periodically flush a store until `shutdown` flips to `true`.
///
/// A final flush runs on the way out.
pub fn spawn_flush_task<V: StoreValue>(
    store: Arc<dyn PathStore<V>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        debug!("Flush task started for {}", store.describe());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.flush().await {
                        warn!("Periodic flush of {} failed: {}", store.describe(), e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = store.flush().await {
            warn!("Final flush of {} failed: {}", store.describe(), e);
        }
        debug!("Flush task stopped for {}", store.describe());
    })
}
