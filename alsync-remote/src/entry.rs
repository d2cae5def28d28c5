use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One file or directory as reported by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_dir: bool,
    /// RFC3339 timestamp as sent by the service
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub sign: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<i64>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Fields this client does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: i64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            modified: Some(modified.to_rfc3339()),
            sign: None,
            kind: Some(0),
            provider: None,
            extra: Map::new(),
        }
    }

    pub fn directory(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            is_dir: true,
            modified: Some(modified.to_rfc3339()),
            sign: None,
            kind: Some(1),
            provider: None,
            extra: Map::new(),
        }
    }

    /// Modified time as epoch seconds.
    ///
    /// Offsets and fractional seconds are honoured. Timestamps without an
    /// offset are read as UTC.
    pub fn modified_timestamp(&self) -> Option<i64> {
        let raw = self.modified.as_deref()?.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.timestamp());
        }
        let head = raw.get(..19).unwrap_or(raw);
        NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc().timestamp())
    }
}

/// Body of a directory listing response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub content: Option<Vec<RemoteEntry>>,
    #[serde(default)]
    pub total: i64,
}
