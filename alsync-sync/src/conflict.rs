//! Last-writer-wins source selection

use std::sync::Arc;
use tracing::{debug, info};

use alsync_store::{CacheEntry, SyncTask, UpdateCache};

use crate::errors::Result;

/// Outcome of resolving one sub-path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Some replica no longer holds a plain magnitude, usually because it
    /// is already a task from an earlier pass
    NoDecision,
    /// No replica changed since its baseline
    Unchanged,
    /// `source` wins and a task was created for each target
    Propagate { source: String, targets: Vec<String> },
}

pub struct ConflictResolver {
    cache: Arc<UpdateCache>,
}

impl ConflictResolver {
    pub fn new(cache: Arc<UpdateCache>) -> Self {
        Self { cache }
    }

    /// Pick the authoritative replica of `sub_path` and seed tasks for the
    /// others.
    ///
    /// The source is the replica with the largest magnitude; on a tie the
    /// first item directory in configuration order wins. Missing replicas
    /// count as magnitude 0.
    pub async fn resolve(&self, sub_path: &str) -> Result<Resolution> {
        let paths = self.cache.item_dirs().expand(sub_path);

        let mut magnitudes = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.cache.get(path).await {
                None => magnitudes.push(0),
                Some(CacheEntry::Magnitude(m)) => magnitudes.push(m),
                Some(other) => {
                    debug!("No decision for {}: {} holds {:?}", sub_path, path, other);
                    return Ok(Resolution::NoDecision);
                }
            }
        }

        let Some(winner) = pick_source(&magnitudes) else {
            return Ok(Resolution::NoDecision);
        };

        if magnitudes[winner] == 0 {
            for path in &paths {
                self.cache.delete(path).await?;
            }
            debug!("{} unchanged in every item", sub_path);
            return Ok(Resolution::Unchanged);
        }

        let source = paths[winner].clone();
        self.cache.delete(&source).await?;

        let mut targets = Vec::with_capacity(paths.len().saturating_sub(1));
        for (idx, path) in paths.iter().enumerate() {
            if idx == winner {
                continue;
            }
            self.cache.create_task(path, SyncTask::new(source.clone())).await?;
            targets.push(path.clone());
        }

        info!(
            "{} wins for {} (magnitude {}), {} target(s)",
            source,
            sub_path,
            magnitudes[winner],
            targets.len()
        );
        Ok(Resolution::Propagate { source, targets })
    }
}

/// Index of the first strictly largest value
fn pick_source(magnitudes: &[i64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, m) in magnitudes.iter().enumerate() {
        match best {
            Some(b) if magnitudes[b] >= *m => {}
            _ => best = Some(idx),
        }
    }
    best
}
