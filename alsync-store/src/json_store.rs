//! JSON document back-end
//!
//! The whole store is one JSON document held in memory. Mutations mark the
//! document dirty; `flush` writes it out atomically (temp file + rename).
//! A store opened with [`JsonPathStore::in_memory`] never touches disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::paths::ItemDirs;
use crate::store::{PathStore, StoreValue};

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "V: StoreValue")]
struct Document<V> {
    #[serde(default)]
    lock: bool,
    #[serde(default)]
    items: BTreeMap<String, BTreeMap<String, V>>,
    /// Keys outside every item directory. `update` refuses such paths, so
    /// this only holds entries of documents written by older versions; they
    /// stay readable through `search` and removable through `delete`.
    #[serde(default)]
    raw: BTreeMap<String, V>,
}

impl<V> Document<V> {
    fn empty() -> Self {
        Self {
            lock: false,
            items: BTreeMap::new(),
            raw: BTreeMap::new(),
        }
    }
}

pub struct JsonPathStore<V: StoreValue> {
    path: Option<PathBuf>,
    item_dirs: ItemDirs,
    document: Mutex<Document<V>>,
    dirty: AtomicBool,
}

impl<V: StoreValue> JsonPathStore<V> {
    /// Load the document at `path`; a missing or empty file is an empty store
    pub fn open(path: impl AsRef<Path>, item_dirs: ItemDirs) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document = match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                info!("Loading JSON store from {}", path.display());
                serde_json::from_str(&content)?
            }
            Ok(_) => Document::empty(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::empty(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            path: Some(path),
            item_dirs,
            document: Mutex::new(document),
            dirty: AtomicBool::new(false),
        })
    }

    /// Non-durable store
    pub fn in_memory(item_dirs: ItemDirs) -> Self {
        Self {
            path: None,
            item_dirs,
            document: Mutex::new(Document::empty()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}

#[async_trait]
impl<V: StoreValue> PathStore<V> for JsonPathStore<V> {
    fn item_dirs(&self) -> &ItemDirs {
        &self.item_dirs
    }

    async fn search(&self, path: &str) -> Option<V> {
        let document = self.document.lock().await;
        match self.item_dirs.decompose(path) {
            Ok((item, sub)) => document.items.get(&item).and_then(|m| m.get(&sub)).cloned(),
            Err(_) => document.raw.get(path).cloned(),
        }
    }

    async fn update(&self, path: &str, value: V) -> Result<()> {
        let mut document = self.document.lock().await;
        if document.lock {
            return Err(StoreError::Locked(path.to_string()));
        }

        let (item, sub) = self.item_dirs.decompose(path)?;
        let existing = document.items.get(&item).and_then(|m| m.get(&sub));
        if !value.verify(existing) {
            return Err(StoreError::Validation(path.to_string()));
        }

        document.items.entry(item).or_default().insert(sub, value);
        self.mark_dirty();
        debug!("Updated {}", path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut document = self.document.lock().await;
        if document.lock {
            return Err(StoreError::Locked(path.to_string()));
        }

        let removed = match self.item_dirs.decompose(path) {
            Ok((item, sub)) => document
                .items
                .get_mut(&item)
                .and_then(|m| m.remove(&sub))
                .is_some(),
            Err(StoreError::OutsideItems(_)) => document.raw.remove(path).is_some(),
            Err(e) => return Err(e),
        };

        if removed {
            self.mark_dirty();
            debug!("Deleted {}", path);
        } else {
            debug!("{} does not exist, nothing to delete", path);
        }
        Ok(())
    }

    async fn sub_paths(&self, item_dir: &str) -> Result<Vec<String>> {
        let document = self.document.lock().await;
        Ok(document
            .items
            .get(item_dir)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn full_paths(&self) -> Result<Vec<(String, V)>> {
        let document = self.document.lock().await;
        let mut entries = Vec::new();
        for item in self.item_dirs.iter() {
            if let Some(subs) = document.items.get(item) {
                for (sub, value) in subs {
                    entries.push((ItemDirs::join(item, sub), value.clone()));
                }
            }
        }
        Ok(entries)
    }

    async fn lock(&self) -> Result<()> {
        let mut document = self.document.lock().await;
        if !document.lock {
            document.lock = true;
            self.mark_dirty();
        }
        debug!("{} is locked", self.describe());
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let mut document = self.document.lock().await;
        if document.lock {
            document.lock = false;
            self.mark_dirty();
        }
        debug!("{} is unlocked", self.describe());
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        self.document.lock().await.lock
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let document = self.document.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let content = match serde_json::to_vec(&*document) {
            Ok(content) => content,
            Err(e) => {
                self.mark_dirty();
                return Err(e.into());
            }
        };
        drop(document);

        let target = path.clone();
        let len = content.len();
        let written = tokio::task::spawn_blocking(move || write_atomically(&target, &content))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        if let Err(e) = written {
            self.mark_dirty();
            return Err(e.into());
        }

        debug!("Saved {} bytes to {}", len, path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("json store {}", path.display()),
            None => "in-memory store".to_string(),
        }
    }
}

impl<V: StoreValue> Drop for JsonPathStore<V> {
    fn drop(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        if !self.is_dirty() {
            return;
        }

        let document = self.document.get_mut();
        match serde_json::to_vec(&*document) {
            Ok(content) => match write_atomically(path, &content) {
                Ok(()) => debug!("Saved {} on drop", path.display()),
                Err(e) => warn!("Failed to save {} on drop: {}", path.display(), e),
            },
            Err(e) => warn!("Failed to serialize {} on drop: {}", path.display(), e),
        }
    }
}
