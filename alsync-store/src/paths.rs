//! Item directory bookkeeping and full-path decomposition
//!
//! Every path handled by a store is a full remote path that starts with
//! exactly one configured item directory. The remainder is the `sub_path`,
//! which is what ties the replicas of one file together.

use crate::errors::{Result, StoreError};

/// Sub-path used for the item directory itself
pub const ROOT_SUB_PATH: &str = ".";

/// Ordered set of item directories.
///
/// Order is configuration order and is the enumeration order used by every
/// store and by conflict resolution tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDirs {
    dirs: Vec<String>,
}

impl ItemDirs {
    /// Build from configured directories, normalizing and de-duplicating
    pub fn new<I, S>(dirs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for dir in dirs {
            let dir = normalize(dir.as_ref())?;
            if !dir.starts_with('/') {
                return Err(StoreError::InvalidPath(format!(
                    "item directory must be absolute: {}",
                    dir
                )));
            }
            if !normalized.contains(&dir) {
                normalized.push(dir);
            }
        }

        for a in &normalized {
            for b in &normalized {
                if a != b && is_under(b, a) {
                    return Err(StoreError::InvalidPath(format!(
                        "item directory {} is nested inside {}",
                        b, a
                    )));
                }
            }
        }

        if normalized.is_empty() {
            return Err(StoreError::InvalidPath(
                "at least one item directory is required".to_string(),
            ));
        }

        Ok(Self { dirs: normalized })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.dirs.iter().any(|d| d == dir)
    }

    /// Split a full path into `(item_dir, sub_path)`.
    ///
    /// The item directory itself decomposes to [`ROOT_SUB_PATH`].
    pub fn decompose(&self, path: &str) -> Result<(String, String)> {
        let path = normalize(path)?;
        for dir in &self.dirs {
            if path == *dir {
                return Ok((dir.clone(), ROOT_SUB_PATH.to_string()));
            }
            if is_under(&path, dir) {
                let sub = path[prefix_len(dir)..].to_string();
                return Ok((dir.clone(), sub));
            }
        }
        Err(StoreError::OutsideItems(path))
    }

    /// Full path of `sub_path` under `item_dir`
    pub fn join(item_dir: &str, sub_path: &str) -> String {
        if sub_path == ROOT_SUB_PATH {
            return item_dir.to_string();
        }
        if item_dir.ends_with('/') {
            format!("{}{}", item_dir, sub_path)
        } else {
            format!("{}/{}", item_dir, sub_path)
        }
    }

    /// Full paths of `sub_path` under every item directory, in item order
    pub fn expand(&self, sub_path: &str) -> Vec<String> {
        self.dirs.iter().map(|d| Self::join(d, sub_path)).collect()
    }
}

/// Collapse duplicate and trailing slashes and `.` segments.
///
/// `..` is rejected rather than resolved.
pub fn normalize(path: &str) -> Result<String> {
    let absolute = path.starts_with('/');
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(StoreError::InvalidPath(path.to_string())),
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    if absolute {
        Ok(format!("/{}", joined))
    } else if joined.is_empty() {
        Err(StoreError::InvalidPath(path.to_string()))
    } else {
        Ok(joined)
    }
}

/// Parent directory of a normalized full path
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Final component of a normalized full path
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Extension including the leading dot, or an empty string
pub fn suffix(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &name[idx..],
    }
}

fn prefix_len(dir: &str) -> usize {
    if dir == "/" {
        1
    } else {
        dir.len() + 1
    }
}

fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
