//! The remote file service contract

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use crate::entry::RemoteEntry;
use crate::errors::Result;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Operations the coordinator needs from the remote file service.
///
/// Move and copy may complete asynchronously on the service side: a
/// successful call only means the request was accepted, so callers confirm
/// the result with `get_metadata`.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// One page of a directory listing. Pages start at 1; an empty page
    /// means the listing is exhausted.
    async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<Vec<RemoteEntry>>;

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry>;

    /// Create a directory and any missing parents
    async fn make_dir(&self, path: &str) -> Result<()>;

    async fn move_entry(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()>;

    async fn rename(&self, path: &str, new_name: &str) -> Result<()>;

    async fn copy(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()>;

    async fn create_file(&self, path: &str, data: Vec<u8>) -> Result<()>;

    fn describe(&self) -> String;
}

/// Lazily paged directory listing
pub struct DirListing {
    remote: Arc<dyn RemoteStorage>,
    path: String,
    per_page: u32,
    next_page: u32,
    buffer: VecDeque<RemoteEntry>,
    exhausted: bool,
}

impl DirListing {
    pub fn new(remote: Arc<dyn RemoteStorage>, path: impl Into<String>, per_page: u32) -> Self {
        Self {
            remote,
            path: path.into(),
            per_page: per_page.max(1),
            next_page: 1,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next entry, fetching another page when the buffer runs dry
    pub async fn next(&mut self) -> Result<Option<RemoteEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .remote
                .list_page(&self.path, self.next_page, self.per_page)
                .await?;
            trace!(
                "Listed page {} of {}: {} entries",
                self.next_page,
                self.path,
                page.len()
            );
            if page.is_empty() {
                self.exhausted = true;
            }
            self.next_page += 1;
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the whole listing
    pub async fn collect(mut self) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Start a lazy listing of `path`
pub fn list(remote: &Arc<dyn RemoteStorage>, path: &str, per_page: u32) -> DirListing {
    DirListing::new(Arc::clone(remote), path, per_page)
}
