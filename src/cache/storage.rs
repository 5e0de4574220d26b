//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{StorageError, StorageResult};
use crate::net::{Headers, HttpResponse};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Entries are grouped into named partitions and keyed by request key.
pub trait CacheStorage: Send + Sync {
  /// Look up a response.
  fn get(&self, partition: &str, key: &str) -> StorageResult<Option<CachedResponse>>;

  /// Store a response, replacing any previous one for the same key.
  fn put(&self, partition: &str, key: &str, url: &str, response: &HttpResponse)
    -> StorageResult<()>;

  /// Remove one entry.
  fn remove(&self, partition: &str, key: &str) -> StorageResult<()>;

  /// Delete entries cached before `cutoff`; returns how many were removed.
  fn purge_older_than(&self, partition: &str, cutoff: DateTime<Utc>) -> StorageResult<usize>;

  /// Evict oldest entries until at most `max_entries` remain.
  fn enforce_max_entries(&self, partition: &str, max_entries: usize) -> StorageResult<usize>;

  /// Number of entries in a partition.
  fn count(&self, partition: &str) -> StorageResult<usize>;

  /// Names of every partition holding at least one entry.
  fn partitions(&self) -> StorageResult<Vec<String>>;

  /// Drop a whole partition.
  fn delete_partition(&self, partition: &str) -> StorageResult<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    // The running agent and one-shot commands share this file.
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> StorageResult<()> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(partition, cached_at);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, partition: &str, key: &str) -> StorageResult<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Headers = serde_json::from_str(&headers)?;
        Ok(Some(CachedResponse {
          response: HttpResponse {
            status,
            headers,
            body,
          },
          cached_at: DateTime::from_timestamp_millis(cached_at).unwrap_or_default(),
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    partition: &str,
    key: &str,
    url: &str,
    response: &HttpResponse,
  ) -> StorageResult<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)?;

    // REPLACE re-inserts the row, so rowid also tracks write order.
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key,
        url,
        response.status,
        headers,
        response.body,
        Utc::now().timestamp_millis()
      ],
    )?;

    Ok(())
  }

  fn remove(&self, partition: &str, key: &str) -> StorageResult<()> {
    self.lock()?.execute(
      "DELETE FROM cache_entries WHERE partition = ? AND request_key = ?",
      params![partition, key],
    )?;
    Ok(())
  }

  fn purge_older_than(&self, partition: &str, cutoff: DateTime<Utc>) -> StorageResult<usize> {
    let removed = self.lock()?.execute(
      "DELETE FROM cache_entries WHERE partition = ? AND cached_at < ?",
      params![partition, cutoff.timestamp_millis()],
    )?;
    Ok(removed)
  }

  fn enforce_max_entries(&self, partition: &str, max_entries: usize) -> StorageResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
      params![partition],
      |row| row.get(0),
    )?;

    let excess = count - max_entries as i64;
    if excess <= 0 {
      return Ok(0);
    }

    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE rowid IN (
         SELECT rowid FROM cache_entries WHERE partition = ?
         ORDER BY cached_at ASC, rowid ASC LIMIT ?
       )",
      params![partition, excess],
    )?;
    Ok(removed)
  }

  fn count(&self, partition: &str) -> StorageResult<usize> {
    let count: i64 = self.lock()?.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
      params![partition],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn partitions(&self) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT partition FROM cache_entries ORDER BY partition")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> StorageResult<usize> {
    let removed = self.lock()?.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )?;
    Ok(removed)
  }
}
