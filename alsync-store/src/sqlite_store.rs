//! SQLite back-end
//!
//! One table per consumer: `sub_path` plus one JSON column per item
//! directory. Raw top-level keys and the lock flag live in side tables.
//! Nothing writes raw keys any more (`update` refuses paths outside the item
//! directories); rows left in `<name>_raw` by older databases are still found
//! by `search` and removed by `delete`.
//! Every call writes through, so `flush` has nothing to do.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::paths::ItemDirs;
use crate::store::{PathStore, StoreValue};

const LOCK_KEY: &str = "lock";

pub struct SqlitePathStore<V: StoreValue> {
    conn: Mutex<Connection>,
    table: String,
    item_dirs: ItemDirs,
    _value: std::marker::PhantomData<fn() -> V>,
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn raw_table(table: &str) -> String {
    format!("{}_raw", table)
}

fn meta_table(table: &str) -> String {
    format!("{}_meta", table)
}

impl<V: StoreValue> SqlitePathStore<V> {
    /// Open or create the database at `path` and the table for `name`
    pub fn open(path: impl AsRef<Path>, name: &str, item_dirs: ItemDirs) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!("Opened SQLite store {} ({})", path.display(), name);
        Self::with_connection(conn, name, item_dirs)
    }

    /// In-memory database (for testing)
    pub fn open_in_memory(name: &str, item_dirs: ItemDirs) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, name, item_dirs)
    }

    fn with_connection(conn: Connection, name: &str, item_dirs: ItemDirs) -> Result<Self> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidUri(format!("invalid table name: {}", name)));
        }

        Self::initialize(&conn, name, &item_dirs)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: name.to_string(),
            item_dirs,
            _value: std::marker::PhantomData,
        })
    }

    fn initialize(conn: &Connection, table: &str, item_dirs: &ItemDirs) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                sub_path TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS {raw} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {meta} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
            table = quote_ident(table),
            raw = quote_ident(&raw_table(table)),
            meta = quote_ident(&meta_table(table)),
        ))?;

        let existing: HashSet<String> = {
            let mut stmt =
                conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect::<std::result::Result<_, _>>()?
        };

        for item in item_dirs.iter() {
            if !existing.contains(item) {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} TEXT",
                        quote_ident(table),
                        quote_ident(item)
                    ),
                    [],
                )?;
                info!("Added column for item directory {} to {}", item, table);
            }
        }

        Ok(())
    }

    fn raw_table(&self) -> String {
        raw_table(&self.table)
    }

    fn meta_table(&self) -> String {
        meta_table(&self.table)
    }

    fn locked(&self, conn: &Connection) -> Result<bool> {
        let value: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", quote_ident(&self.meta_table())),
                params![LOCK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("true"))
    }

    fn set_locked(&self, conn: &Connection, locked: bool) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                quote_ident(&self.meta_table())
            ),
            params![LOCK_KEY, if locked { "true" } else { "false" }],
        )?;
        Ok(())
    }

    fn read_cell(&self, conn: &Connection, item: &str, sub: &str) -> Result<Option<V>> {
        let raw: Option<Option<String>> = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE sub_path = ?1",
                    quote_ident(item),
                    quote_ident(&self.table)
                ),
                params![sub],
                |row| row.get(0),
            )
            .optional()?;

        match raw.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn read_raw(&self, conn: &Connection, key: &str) -> Result<Option<V>> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", quote_ident(&self.raw_table())),
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Drop rows whose item columns are all empty
    fn prune_row(&self, conn: &Connection, sub: &str) -> Result<()> {
        let all_null = self
            .item_dirs
            .iter()
            .map(|item| format!("{} IS NULL", quote_ident(item)))
            .collect::<Vec<_>>()
            .join(" AND ");

        conn.execute(
            &format!(
                "DELETE FROM {} WHERE sub_path = ?1 AND {}",
                quote_ident(&self.table),
                all_null
            ),
            params![sub],
        )?;
        Ok(())
    }
}

#[async_trait]
impl<V: StoreValue> PathStore<V> for SqlitePathStore<V> {
    fn item_dirs(&self) -> &ItemDirs {
        &self.item_dirs
    }

    async fn search(&self, path: &str) -> Option<V> {
        let conn = self.conn.lock().await;
        let result = match self.item_dirs.decompose(path) {
            Ok((item, sub)) => self.read_cell(&conn, &item, &sub),
            Err(_) => self.read_raw(&conn, path),
        };

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {} from {}: {}", path, self.table, e);
                None
            }
        }
    }

    async fn update(&self, path: &str, value: V) -> Result<()> {
        let conn = self.conn.lock().await;
        if self.locked(&conn)? {
            return Err(StoreError::Locked(path.to_string()));
        }

        let (item, sub) = self.item_dirs.decompose(path)?;
        let existing = self.read_cell(&conn, &item, &sub)?;
        if !value.verify(existing.as_ref()) {
            return Err(StoreError::Validation(path.to_string()));
        }

        let json = serde_json::to_string(&value)?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (sub_path, {col}) VALUES (?1, ?2)
                 ON CONFLICT(sub_path) DO UPDATE SET {col} = excluded.{col}",
                table = quote_ident(&self.table),
                col = quote_ident(&item),
            ),
            params![sub, json],
        )?;

        debug!("Updated {} in {}", path, self.table);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        if self.locked(&conn)? {
            return Err(StoreError::Locked(path.to_string()));
        }

        match self.item_dirs.decompose(path) {
            Ok((item, sub)) => {
                conn.execute(
                    &format!(
                        "UPDATE {} SET {} = NULL WHERE sub_path = ?1",
                        quote_ident(&self.table),
                        quote_ident(&item)
                    ),
                    params![sub],
                )?;
                self.prune_row(&conn, &sub)?;
            }
            Err(StoreError::OutsideItems(_)) => {
                conn.execute(
                    &format!("DELETE FROM {} WHERE key = ?1", quote_ident(&self.raw_table())),
                    params![path],
                )?;
            }
            Err(e) => return Err(e),
        }

        debug!("Deleted {} from {}", path, self.table);
        Ok(())
    }

    async fn sub_paths(&self, item_dir: &str) -> Result<Vec<String>> {
        if !self.item_dirs.contains(item_dir) {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT sub_path FROM {} WHERE {} IS NOT NULL ORDER BY sub_path",
            quote_ident(&self.table),
            quote_ident(item_dir)
        ))?;
        let subs = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(subs.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn full_paths(&self) -> Result<Vec<(String, V)>> {
        let conn = self.conn.lock().await;
        let mut entries = Vec::new();

        for item in self.item_dirs.iter() {
            let mut stmt = conn.prepare(&format!(
                "SELECT sub_path, {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY sub_path",
                table = quote_ident(&self.table),
                col = quote_ident(item)
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (sub, json) = row?;
                entries.push((ItemDirs::join(item, &sub), serde_json::from_str(&json)?));
            }
        }

        Ok(entries)
    }

    async fn lock(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        self.set_locked(&conn, true)?;
        debug!("{} is locked", self.table);
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        self.set_locked(&conn, false)?;
        debug!("{} is unlocked", self.table);
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        let conn = self.conn.lock().await;
        self.locked(&conn).unwrap_or_else(|e| {
            warn!("Failed to read lock flag of {}: {}", self.table, e);
            false
        })
    }

    fn describe(&self) -> String {
        format!("sqlite table {}", self.table)
    }
}
