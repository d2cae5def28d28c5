use std::time::Duration;

use crate::errors::{Result, SyncError};

pub const DEFAULT_BACKUP_DIR_NAME: &str = ".alist_sync_backup";

/// Tunables for one coordinator
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the per-item directory that receives overwritten files
    pub backup_dir_name: String,
    /// Delay between verification polls
    pub poll_interval: Duration,
    /// Give up on a verification loop after this many polls
    pub max_poll_attempts: Option<u32>,
    /// How often dirty stores are written out during a run
    pub flush_interval: Duration,
    /// Entries requested per listing page
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backup_dir_name: DEFAULT_BACKUP_DIR_NAME.to_string(),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: None,
            flush_interval: Duration::from_secs(5),
            page_size: alsync_remote::DEFAULT_PAGE_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        let name = self.backup_dir_name.as_str();
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SyncError::Config(format!(
                "invalid backup directory name: {:?}",
                name
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll interval must be positive".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(SyncError::Config("flush interval must be positive".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be positive".to_string()));
        }
        if self.max_poll_attempts == Some(0) {
            return Err(SyncError::Config(
                "max poll attempts must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
