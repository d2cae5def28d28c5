use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use alsync_store::ItemDirs;
use alsync_sync::{SyncConfig, DEFAULT_BACKUP_DIR_NAME};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Replicated directories on the remote service
    pub items: Vec<String>,
    /// Store URI shared by the file records and the update cache
    pub cache_path: String,
    #[serde(default = "default_backup_dir_name")]
    pub backup_dir_name: String,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub poll_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_attempts: Option<u32>,
    pub flush_interval_secs: u64,
    pub page_size: u32,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_poll_attempts: None,
            flush_interval_secs: 5,
            page_size: alsync_remote::DEFAULT_PAGE_SIZE,
        }
    }
}

/// How to authenticate against the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Token(String),
    Credentials { username: String, password: String },
}

fn default_backup_dir_name() -> String {
    DEFAULT_BACKUP_DIR_NAME.to_string()
}

impl Config {
    /// Template written by `alsync init`
    pub fn example() -> Self {
        Self {
            items: vec!["/onedrive/sync".to_string(), "/local/sync".to_string()],
            cache_path: "sqlite:///var/lib/alsync/cache.db".to_string(),
            backup_dir_name: default_backup_dir_name(),
            remote: RemoteConfig {
                base_url: "http://127.0.0.1:5244/api".to_string(),
                token: Some("replace-me".to_string()),
                username: None,
                password: None,
            },
            sync: SyncSection::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let items = self.item_dirs()?;
        if items.len() < 2 {
            bail!("at least two distinct item directories are required");
        }
        self.auth()?;
        self.sync_config().validate()?;
        Ok(())
    }

    pub fn item_dirs(&self) -> Result<ItemDirs> {
        ItemDirs::new(&self.items).context("Invalid item directories")
    }

    pub fn auth(&self) -> Result<Auth> {
        let remote = &self.remote;
        match (&remote.token, &remote.username, &remote.password) {
            (Some(token), None, None) => Ok(Auth::Token(token.clone())),
            (None, Some(username), Some(password)) => Ok(Auth::Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, None, None) => bail!("remote needs either a token or username and password"),
            _ => bail!("remote must use exactly one of token or username/password"),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            backup_dir_name: self.backup_dir_name.clone(),
            poll_interval: Duration::from_secs(self.sync.poll_interval_secs),
            max_poll_attempts: self.sync.max_poll_attempts,
            flush_interval: Duration::from_secs(self.sync.flush_interval_secs),
            page_size: self.sync.page_size,
        }
    }
}

/// Get the path to the config file
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".alsync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
items = ["/onedrive/tmp", "/local/tmp/"]
cache_path = "json:///tmp/alsync/cache.json"

[remote]
base_url = "https://alist.example.com/api"
username = "admin"
password = "secret"
"#;

    #[test]
    fn test_parse_minimal_config_with_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backup_dir_name, ".alist_sync_backup");
        assert_eq!(config.sync.poll_interval_secs, 5);
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(
            config.auth().unwrap(),
            Auth::Credentials {
                username: "admin".to_string(),
                password: "secret".to_string()
            }
        );

        assert_eq!(config.item_dirs().unwrap().len(), 2);
        assert!(config.item_dirs().unwrap().contains("/local/tmp"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::example();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.items, config.items);
        assert_eq!(loaded.cache_path, config.cache_path);
        assert_eq!(loaded.auth().unwrap(), Auth::Token("replace-me".to_string()));
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.remote.token = Some("t".to_string());
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.items = vec!["/a".to_string(), "/a/b".to_string()];
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.items = vec!["/a".to_string(), "/a/".to_string()];
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.backup_dir_name = "".to_string();
        assert!(config.validate().is_err());
    }
}
