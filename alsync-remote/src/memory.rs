//! In-process remote used for tests and dry runs
//!
//! Entries moved or copied can be held back for a number of metadata polls,
//! which reproduces services that finish transfers in the background.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::entry::RemoteEntry;
use crate::errors::{RemoteError, Result};
use crate::storage::RemoteStorage;

#[derive(Debug, Clone)]
struct Node {
    entry: RemoteEntry,
    content: Vec<u8>,
    /// Lookups that still report this node as missing
    hidden_polls: u32,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    transfer_delay: u32,
    failing: BTreeSet<String>,
}

impl Tree {
    fn fail_if_injected(&self, path: &str) -> Result<()> {
        if self.failing.contains(path) {
            return Err(RemoteError::Server {
                code: 500,
                message: format!("injected failure for {}", path),
            });
        }
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.nodes.get(path).map_or(false, |n| n.entry.is_dir)
    }

    fn ensure_dirs(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.nodes.entry(current.clone()).or_insert_with(|| Node {
                entry: RemoteEntry::directory(segment, Utc::now()),
                content: Vec::new(),
                hidden_polls: 0,
            });
        }
    }

    /// Paths of `path` and everything below it
    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .keys()
            .filter(|key| key.as_str() == path || key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn transfer(
        &mut self,
        src_dir: &str,
        dst_dir: &str,
        names: &[String],
        keep_source: bool,
    ) -> Result<()> {
        if !self.is_dir(dst_dir) {
            return Err(RemoteError::NotFound(dst_dir.to_string()));
        }
        for name in names {
            let source = join(src_dir, name);
            self.fail_if_injected(&source)?;
            if !self.nodes.contains_key(&source) {
                return Err(RemoteError::NotFound(source));
            }
            let target = join(dst_dir, name);
            if target == source {
                continue;
            }
            for old in self.subtree(&target) {
                self.nodes.remove(&old);
            }
            for path in self.subtree(&source) {
                let node = if keep_source {
                    self.nodes.get(&path).cloned()
                } else {
                    self.nodes.remove(&path)
                };
                if let Some(mut node) = node {
                    node.hidden_polls = self.transfer_delay;
                    let moved = format!("{}{}", target, &path[source.len()..]);
                    self.nodes.insert(moved, node);
                }
            }
        }
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{}/{}", dir, name))
}

fn split(path: &str) -> (String, String) {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path),
    }
}

#[derive(Default)]
pub struct MemoryRemote {
    tree: Mutex<Tree>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold moved and copied entries back for `polls` metadata lookups
    pub async fn set_transfer_delay(&self, polls: u32) {
        self.tree.lock().await.transfer_delay = polls;
    }

    /// Make every operation touching `path` fail with a server error
    pub async fn inject_failure(&self, path: &str) {
        self.tree.lock().await.failing.insert(normalize(path));
    }

    pub async fn clear_failure(&self, path: &str) {
        self.tree.lock().await.failing.remove(&normalize(path));
    }

    pub async fn put_file(&self, path: &str, content: &[u8], modified: DateTime<Utc>) {
        let path = normalize(path);
        let (parent, name) = split(&path);
        let mut tree = self.tree.lock().await;
        tree.ensure_dirs(&parent);
        tree.nodes.insert(
            path,
            Node {
                entry: RemoteEntry::file(name, content.len() as i64, modified),
                content: content.to_vec(),
                hidden_polls: 0,
            },
        );
    }

    pub async fn put_dir(&self, path: &str) {
        self.tree.lock().await.ensure_dirs(&normalize(path));
    }

    /// Entry at `path` regardless of pending visibility
    pub async fn entry(&self, path: &str) -> Option<RemoteEntry> {
        let tree = self.tree.lock().await;
        tree.nodes.get(&normalize(path)).map(|n| n.entry.clone())
    }

    pub async fn content(&self, path: &str) -> Option<Vec<u8>> {
        let tree = self.tree.lock().await;
        tree.nodes.get(&normalize(path)).map(|n| n.content.clone())
    }

    /// Every stored path, directories included
    pub async fn paths(&self) -> Vec<String> {
        self.tree.lock().await.nodes.keys().cloned().collect()
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<Vec<RemoteEntry>> {
        let path = normalize(path);
        let tree = self.tree.lock().await;
        tree.fail_if_injected(&path)?;
        if !tree.is_dir(&path) {
            return Err(RemoteError::NotFound(path));
        }

        let per_page = per_page.max(1) as usize;
        let skip = (page.max(1) as usize - 1) * per_page;
        Ok(tree
            .nodes
            .iter()
            .filter(|(key, node)| node.hidden_polls == 0 && split(key).0 == path)
            .map(|(_, node)| node.entry.clone())
            .skip(skip)
            .take(per_page)
            .collect())
    }

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry> {
        let path = normalize(path);
        let mut tree = self.tree.lock().await;
        tree.fail_if_injected(&path)?;
        match tree.nodes.get_mut(&path) {
            Some(node) if node.hidden_polls > 0 => {
                node.hidden_polls -= 1;
                Err(RemoteError::NotFound(path))
            }
            Some(node) => Ok(node.entry.clone()),
            None => Err(RemoteError::NotFound(path)),
        }
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.tree.lock().await;
        tree.fail_if_injected(&path)?;
        tree.ensure_dirs(&path);
        Ok(())
    }

    async fn move_entry(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()> {
        debug!("memory move {:?} from {} to {}", names, src_dir, dst_dir);
        let mut tree = self.tree.lock().await;
        tree.transfer(&normalize(src_dir), &normalize(dst_dir), names, false)
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.tree.lock().await;
        tree.fail_if_injected(&path)?;
        if !tree.nodes.contains_key(&path) {
            return Err(RemoteError::NotFound(path));
        }

        let (parent, _) = split(&path);
        let target = join(&parent, new_name);
        if tree.nodes.contains_key(&target) {
            return Err(RemoteError::Request {
                code: 403,
                message: format!("{} already exists", target),
            });
        }

        for old in tree.subtree(&path) {
            if let Some(mut node) = tree.nodes.remove(&old) {
                if old == path {
                    node.entry.name = new_name.to_string();
                }
                let renamed = format!("{}{}", target, &old[path.len()..]);
                tree.nodes.insert(renamed, node);
            }
        }
        Ok(())
    }

    async fn copy(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()> {
        debug!("memory copy {:?} from {} to {}", names, src_dir, dst_dir);
        let mut tree = self.tree.lock().await;
        tree.transfer(&normalize(src_dir), &normalize(dst_dir), names, true)
    }

    async fn create_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = normalize(path);
        let (parent, name) = split(&path);
        let mut tree = self.tree.lock().await;
        tree.fail_if_injected(&path)?;
        tree.ensure_dirs(&parent);
        tree.nodes.insert(
            path,
            Node {
                entry: RemoteEntry::file(name, data.len() as i64, Utc::now()),
                content: data,
                hidden_polls: 0,
            },
        );
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_listing_pages_until_empty() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote
                .put_file(&format!("/a/f{}.txt", i), b"x", at(100))
                .await;
        }
        remote.put_dir("/a/sub").await;

        let remote: Arc<dyn RemoteStorage> = Arc::new(remote);
        assert_eq!(remote.list_page("/a", 1, 2).await.unwrap().len(), 2);
        assert_eq!(remote.list_page("/a", 4, 2).await.unwrap().len(), 0);

        let names: Vec<String> = list(&remote, "/a", 2)
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["f0.txt", "f1.txt", "f2.txt", "f3.txt", "f4.txt", "sub"]);

        assert!(list(&remote, "/missing", 2).collect().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_rename_and_copy() {
        let remote = MemoryRemote::new();
        remote.put_file("/b/f.txt", b"old", at(100)).await;
        remote.put_file("/a/f.txt", b"newer", at(200)).await;
        remote.make_dir("/b/.backup").await.unwrap();

        remote
            .move_entry("/b", "/b/.backup", &["f.txt".to_string()])
            .await
            .unwrap();
        remote.rename("/b/.backup/f.txt", "hash.txt").await.unwrap();
        assert!(remote.get_metadata("/b/f.txt").await.unwrap_err().is_not_found());
        assert_eq!(remote.content("/b/.backup/hash.txt").await.unwrap(), b"old");

        remote
            .copy("/a", "/b", &["f.txt".to_string()])
            .await
            .unwrap();
        let copied = remote.get_metadata("/b/f.txt").await.unwrap();
        assert_eq!(copied.size, 5);
        assert_eq!(copied.modified_timestamp(), Some(200));
        assert!(remote.entry("/a/f.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_transfer_delay_hides_destination() {
        let remote = MemoryRemote::new();
        remote.put_file("/a/f.txt", b"data", at(100)).await;
        remote.put_dir("/b").await;
        remote.set_transfer_delay(2).await;

        remote
            .copy("/a", "/b", &["f.txt".to_string()])
            .await
            .unwrap();
        assert!(remote.get_metadata("/b/f.txt").await.is_err());
        assert!(remote.get_metadata("/b/f.txt").await.is_err());
        assert!(remote.get_metadata("/b/f.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_and_create_file() {
        let remote = MemoryRemote::new();
        remote
            .create_file("/a/deep/info.json", b"{}".to_vec())
            .await
            .unwrap();
        assert!(remote.get_metadata("/a/deep").await.unwrap().is_dir);

        remote.inject_failure("/a/deep/info.json").await;
        assert!(matches!(
            remote.get_metadata("/a/deep/info.json").await,
            Err(RemoteError::Server { code: 500, .. })
        ));
        remote.clear_failure("/a/deep/info.json").await;
        assert!(remote.get_metadata("/a/deep/info.json").await.is_ok());
    }
}
