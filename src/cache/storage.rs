//! Cache storage trait, partition handles and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{CachedEntry, RequestKey};
use crate::net::{Request, Response};

/// Trait for cache storage backends.
///
/// A backend holds any number of named partitions. Writes to a single entry are
/// atomic replacements; readers never observe a partially written entry.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist.
  fn open(&self, partition: &str) -> Result<()>;

  /// Whether the partition exists.
  fn has(&self, partition: &str) -> Result<bool>;

  /// Names of all partitions, oldest first.
  fn list_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and all of its entries. Returns false if it did not exist.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// Look up a single entry.
  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Store a single entry, replacing any previous one.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several entries; either all of them land or none do.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Keys stored in a partition.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;
}

/// Handle to one open partition.
///
/// Handles can read and write entries but never delete the partition itself;
/// that is left to the [`CacheManager`](super::CacheManager).
pub struct Partition<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> Partition<S> {
  /// Open (creating if needed) the named partition.
  pub(super) fn open(storage: Arc<S>, name: &str) -> Result<Self> {
    storage.open(name)?;
    Ok(Self {
      storage,
      name: name.to_string(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn match_request(&self, request: &Request) -> Result<Option<CachedEntry>> {
    self.storage.match_entry(&self.name, &RequestKey::from(request))
  }

  pub fn match_key(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.storage.match_entry(&self.name, key)
  }

  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self
      .storage
      .put(&self.name, &RequestKey::from(request), response)
  }

  pub fn put_all(&self, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }
}

impl<S: CacheStorage> Clone for Partition<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    tracing::debug!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per stored response; replaced wholesale on put
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);
"#;

fn insert_entry(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (partition, key_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    Ok(())
  }

  fn has(&self, partition: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM partitions WHERE name = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query partitions: {}", e))?;

    Ok(count > 0)
  }

  fn list_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", key.url, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key.url, e))?;
        Ok(Some(CachedEntry {
          key: key.clone(),
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_entry(&conn, partition, key, response)
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, partition, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("https://app.test/").unwrap().join(path).unwrap())
  }

  fn storage(dir: &TempDir) -> SqliteStorage {
    SqliteStorage::open(Some(&dir.path().join("nested").join("cache.db"))).unwrap()
  }

  #[test]
  fn test_put_and_match() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir);
    let response = Response {
      status: 200,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: b"<html>A</html>".to_vec(),
    };

    storage.open("static-v1").unwrap();
    storage.put("static-v1", &key("/"), &response).unwrap();

    let entry = storage.match_entry("static-v1", &key("/")).unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert_eq!(entry.key, key("/"));

    assert!(storage.match_entry("static-v1", &key("/other")).unwrap().is_none());
    assert!(storage.match_entry("runtime-v1", &key("/")).unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_entry() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir);

    storage.put("runtime-v1", &key("/a.css"), &Response::new(200, "old")).unwrap();
    storage.put("runtime-v1", &key("/a.css"), &Response::new(200, "new")).unwrap();

    let entry = storage.match_entry("runtime-v1", &key("/a.css")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert_eq!(storage.keys("runtime-v1").unwrap().len(), 1);
  }

  #[test]
  fn test_delete_removes_partition_and_entries() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir);

    storage.open("static-v0").unwrap();
    storage.open("static-v1").unwrap();
    storage.put("static-v0", &key("/"), &Response::new(200, "x")).unwrap();

    assert!(storage.delete("static-v0").unwrap());
    assert!(!storage.delete("static-v0").unwrap());
    assert!(!storage.has("static-v0").unwrap());
    assert!(storage.match_entry("static-v0", &key("/")).unwrap().is_none());
    assert_eq!(storage.list_names().unwrap(), vec!["static-v1".to_string()]);
  }

  #[test]
  fn test_partitions_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
      let storage = storage(&dir);
      storage
        .put_all(
          "static-v1",
          &[
            (key("/"), Response::new(200, "root")),
            (key("/index.html"), Response::new(200, "index")),
          ],
        )
        .unwrap();
    }

    let storage = storage(&dir);
    assert!(storage.has("static-v1").unwrap());
    let keys = storage.keys("static-v1").unwrap();
    assert_eq!(keys, vec![key("/"), key("/index.html")]);
  }
}
