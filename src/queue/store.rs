//! Queue store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{DeadLetter, QueuedRequest, StoredRequest};
use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::net::Headers;

/// Durable, ordered log of pending order submissions.
pub trait QueueStore: Send + Sync {
  /// Append a new entry and return its id.
  fn enqueue(&self, request: &StoredRequest) -> StorageResult<i64>;

  /// Append a drained entry again after a failed send. It gets a fresh id,
  /// keeps its `created_at` and has its attempt count incremented.
  fn requeue(&self, entry: &QueuedRequest) -> StorageResult<i64>;

  /// Read every entry in insertion order and remove them in one transaction.
  fn drain_all(&self) -> StorageResult<Vec<QueuedRequest>>;

  /// Number of pending entries.
  fn count(&self) -> StorageResult<usize>;

  /// Pending entries without removing them.
  fn peek_all(&self) -> StorageResult<Vec<QueuedRequest>>;

  /// Park an entry that will not be retried.
  fn dead_letter(&self, entry: &QueuedRequest, reason: &str) -> StorageResult<()>;

  fn dead_letters(&self) -> StorageResult<Vec<DeadLetter>>;
}

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
  table: String,
}

impl SqliteQueueStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, config: &StoreConfig) -> StorageResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    // Other processes may be draining the same file.
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::with_connection(conn, config)
  }

  pub fn open_in_memory(config: &StoreConfig) -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?, config)
  }

  fn with_connection(conn: Connection, config: &StoreConfig) -> StorageResult<Self> {
    if !is_identifier(&config.table) {
      return Err(StorageError::Sqlite(rusqlite::Error::InvalidParameterName(
        config.table.clone(),
      )));
    }

    let store = Self {
      conn: Mutex::new(conn),
      table: config.table.clone(),
    };
    store.run_migrations(config.version)?;

    Ok(store)
  }

  /// Create the tables when the stored schema version is older than ours.
  fn run_migrations(&self, version: u32) -> StorageResult<()> {
    let conn = self.lock()?;
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current >= version {
      return Ok(());
    }

    debug!(from = current, to = version, table = %self.table, "Upgrading queue schema");
    conn.execute_batch(&queue_schema(&self.table))?;
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;

    Ok(())
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))
  }

  fn insert(
    &self,
    conn: &Connection,
    created_at: DateTime<Utc>,
    attempts: u32,
    request: &StoredRequest,
  ) -> StorageResult<i64> {
    if request.url.is_empty() {
      return Err(StorageError::MissingField("url"));
    }
    if request.method.is_empty() {
      return Err(StorageError::MissingField("method"));
    }

    let headers = serde_json::to_string(&request.headers)?;
    let body = serde_json::to_string(&request.body)?;
    conn.execute(
      &format!(
        "INSERT INTO {} (created_at, attempts, url, method, headers, body)
         VALUES (?, ?, ?, ?, ?, ?)",
        self.table
      ),
      params![
        created_at.timestamp_millis(),
        attempts,
        request.url,
        request.method,
        headers,
        body
      ],
    )?;

    Ok(conn.last_insert_rowid())
  }

  fn select_pending(&self, conn: &Connection) -> StorageResult<Vec<RawEntry>> {
    let mut stmt = conn.prepare(&format!(
      "SELECT id, created_at, attempts, url, method, headers, body FROM {} ORDER BY id",
      self.table
    ))?;
    let rows = stmt
      .query_map([], RawEntry::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
  }

  fn insert_dead(&self, conn: &Connection, entry: &RawEntry, reason: &str) -> StorageResult<()> {
    conn.execute(
      &format!(
        "INSERT OR REPLACE INTO {}_dead
           (id, created_at, attempts, url, method, headers, body, reason, failed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        self.table
      ),
      params![
        entry.id,
        entry.created_at,
        entry.attempts,
        entry.url,
        entry.method,
        entry.headers,
        entry.body,
        reason,
        Utc::now().timestamp_millis()
      ],
    )?;
    Ok(())
  }

  /// Decode drained rows; rows that cannot be decoded are parked instead of
  /// blocking every future drain.
  fn decode_or_park(
    &self,
    tx: &Transaction<'_>,
    rows: Vec<RawEntry>,
  ) -> StorageResult<Vec<QueuedRequest>> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
      match row.decode() {
        Ok(entry) => entries.push(entry),
        Err(e) => {
          warn!(id = row.id, error = %e, "Queued order is corrupt, moving it to dead letters");
          self.insert_dead(tx, &row, &format!("corrupt entry: {}", e))?;
        }
      }
    }
    Ok(entries)
  }
}

impl QueueStore for SqliteQueueStore {
  fn enqueue(&self, request: &StoredRequest) -> StorageResult<i64> {
    let conn = self.lock()?;
    let id = self.insert(&conn, Utc::now(), 0, request)?;
    debug!(id, url = %request.url, "Queued request");
    Ok(id)
  }

  fn requeue(&self, entry: &QueuedRequest) -> StorageResult<i64> {
    let conn = self.lock()?;
    self.insert(
      &conn,
      entry.created_at,
      entry.attempts.saturating_add(1),
      &entry.request,
    )
  }

  fn drain_all(&self) -> StorageResult<Vec<QueuedRequest>> {
    let mut conn = self.lock()?;
    // IMMEDIATE takes the write lock up front so two drains serialize.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let rows = self.select_pending(&tx)?;
    let entries = self.decode_or_park(&tx, rows)?;
    tx.execute(&format!("DELETE FROM {}", self.table), [])?;
    tx.commit()?;

    Ok(entries)
  }

  fn count(&self) -> StorageResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  fn peek_all(&self) -> StorageResult<Vec<QueuedRequest>> {
    let conn = self.lock()?;
    let rows = self.select_pending(&conn)?;
    rows.iter().map(RawEntry::decode).collect()
  }

  fn dead_letter(&self, entry: &QueuedRequest, reason: &str) -> StorageResult<()> {
    let conn = self.lock()?;
    let raw = RawEntry::encode(entry)?;
    self.insert_dead(&conn, &raw, reason)
  }

  fn dead_letters(&self) -> StorageResult<Vec<DeadLetter>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT id, created_at, attempts, url, method, headers, body, reason, failed_at
       FROM {}_dead ORDER BY failed_at, id",
      self.table
    ))?;
    let rows = stmt
      .query_map([], |row| {
        let raw = RawEntry::from_row(row)?;
        let reason: String = row.get(7)?;
        let failed_at: i64 = row.get(8)?;
        Ok((raw, reason, failed_at))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(raw, reason, failed_at)| {
        Ok(DeadLetter {
          entry: raw.decode()?,
          reason,
          failed_at: from_millis(failed_at),
        })
      })
      .collect()
  }
}

/// Row as stored, before JSON decoding.
struct RawEntry {
  id: i64,
  created_at: i64,
  attempts: u32,
  url: String,
  method: String,
  headers: String,
  body: String,
}

impl RawEntry {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      created_at: row.get(1)?,
      attempts: row.get(2)?,
      url: row.get(3)?,
      method: row.get(4)?,
      headers: row.get(5)?,
      body: row.get(6)?,
    })
  }

  fn encode(entry: &QueuedRequest) -> StorageResult<Self> {
    Ok(Self {
      id: entry.id,
      created_at: entry.created_at.timestamp_millis(),
      attempts: entry.attempts,
      url: entry.request.url.clone(),
      method: entry.request.method.clone(),
      headers: serde_json::to_string(&entry.request.headers)?,
      body: serde_json::to_string(&entry.request.body)?,
    })
  }

  fn decode(&self) -> StorageResult<QueuedRequest> {
    let headers: Headers = serde_json::from_str(&self.headers)?;
    let body = serde_json::from_str(&self.body)?;
    Ok(QueuedRequest {
      id: self.id,
      created_at: from_millis(self.created_at),
      attempts: self.attempts,
      request: StoredRequest {
        url: self.url.clone(),
        method: self.method.clone(),
        headers,
        body,
      },
    })
  }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn is_identifier(name: &str) -> bool {
  !name.is_empty()
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Schema for the queue and its dead-letter table.
fn queue_schema(table: &str) -> String {
  format!(
    r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {table}_dead (
    id INTEGER PRIMARY KEY,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL,
    reason TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
"#
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  fn store() -> SqliteQueueStore {
    SqliteQueueStore::open_in_memory(&StoreConfig::default()).unwrap()
  }

  fn order(product_id: u64) -> StoredRequest {
    StoredRequest {
      url: "http://127.0.0.1:8000/api/orders/create/".to_string(),
      method: "POST".to_string(),
      headers: Headers::new()
        .with("content-type", "application/json")
        .with("authorization", "Bearer t"),
      body: json!({ "items": [{ "product_id": product_id, "quantity": 1 }] }),
    }
  }

  #[test]
  fn test_drain_returns_entries_in_insertion_order() {
    let store = store();
    for id in 1..=5 {
      store.enqueue(&order(id)).unwrap();
    }

    let drained = store.drain_all().unwrap();

    assert_eq!(drained.len(), 5);
    let products: Vec<_> = drained
      .iter()
      .map(|e| e.request.body["items"][0]["product_id"].as_u64().unwrap())
      .collect();
    assert_eq!(products, vec![1, 2, 3, 4, 5]);
    assert!(drained.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_drain_empty_store() {
    let store = store();
    assert!(store.drain_all().unwrap().is_empty());
    assert!(store.drain_all().unwrap().is_empty());
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_drained_request_matches_what_was_enqueued() {
    let store = store();
    let original = order(42);
    let id = store.enqueue(&original).unwrap();

    let drained = store.drain_all().unwrap();

    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].id, id);
    assert_eq!(drained[0].request, original);
    assert_eq!(drained[0].attempts, 0);
  }

  #[test]
  fn test_back_to_back_drains_do_not_overlap() {
    let store = store();
    store.enqueue(&order(1)).unwrap();
    store.enqueue(&order(2)).unwrap();

    let first = store.drain_all().unwrap();
    store.enqueue(&order(3)).unwrap();
    let second = store.drain_all().unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(first.iter().all(|a| second.iter().all(|b| a.id != b.id)));
  }

  #[test]
  fn test_concurrent_drains_never_share_entries() {
    let store = Arc::new(store());
    for id in 0..50 {
      store.enqueue(&order(id)).unwrap();
    }

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.drain_all().unwrap())
      })
      .collect();
    let mut ids: Vec<i64> = handles
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .map(|e| e.id)
      .collect();

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_drains_over_separate_connections_never_share_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let config = StoreConfig::default();
    {
      let store = SqliteQueueStore::open(&path, &config).unwrap();
      for id in 0..200 {
        store.enqueue(&order(id)).unwrap();
      }
    }

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let path = path.clone();
        let config = config.clone();
        std::thread::spawn(move || {
          let store = SqliteQueueStore::open(&path, &config).unwrap();
          (0..5)
            .flat_map(|_| store.drain_all().unwrap())
            .map(|e| e.id)
            .collect::<Vec<_>>()
        })
      })
      .collect();
    let mut ids: Vec<i64> = handles
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .collect();

    let drained = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(drained, 200);
    assert_eq!(ids.len(), 200);

    let store = SqliteQueueStore::open(&path, &config).unwrap();
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_ids_are_never_reused() {
    let store = store();
    let first = store.enqueue(&order(1)).unwrap();
    store.drain_all().unwrap();
    let second = store.enqueue(&order(1)).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_requeue_keeps_created_at_and_counts_attempts() {
    let store = store();
    store.enqueue(&order(1)).unwrap();
    let entry = store.drain_all().unwrap().remove(0);

    let new_id = store.requeue(&entry).unwrap();
    let again = store.peek_all().unwrap();

    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, new_id);
    assert_ne!(new_id, entry.id);
    assert_eq!(again[0].created_at, entry.created_at);
    assert_eq!(again[0].attempts, 1);
    assert_eq!(again[0].request, entry.request);
  }

  #[test]
  fn test_enqueue_rejects_missing_url() {
    let store = store();
    let mut request = order(1);
    request.url.clear();

    let err = store.enqueue(&request).unwrap_err();
    assert!(matches!(err, StorageError::MissingField("url")));
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_count_does_not_consume() {
    let store = store();
    store.enqueue(&order(1)).unwrap();
    store.enqueue(&order(2)).unwrap();

    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.peek_all().unwrap().len(), 2);
    assert_eq!(store.count().unwrap(), 2);
  }

  #[test]
  fn test_dead_letters_are_kept_separately() {
    let store = store();
    store.enqueue(&order(9)).unwrap();
    let entry = store.drain_all().unwrap().remove(0);

    store.dead_letter(&entry, "HTTP 400").unwrap();

    assert_eq!(store.count().unwrap(), 0);
    let dead = store.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "HTTP 400");
    assert_eq!(dead[0].entry.request, entry.request);
  }

  #[test]
  fn test_corrupt_row_is_parked_during_drain() {
    let store = store();
    store.enqueue(&order(1)).unwrap();
    store
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO pending_orders (created_at, attempts, url, method, headers, body)
         VALUES (0, 0, 'http://x/', 'POST', '{', '{}')",
        [],
      )
      .unwrap();

    let drained = store.drain_all().unwrap();

    assert_eq!(drained.len(), 1);
    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(
      store
        .lock()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM pending_orders_dead", [], |r| r.get::<_, i64>(0))
        .unwrap(),
      1
    );
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let config = StoreConfig::default();

    {
      let store = SqliteQueueStore::open(&path, &config).unwrap();
      store.enqueue(&order(1)).unwrap();
      store.enqueue(&order(2)).unwrap();
    }

    let store = SqliteQueueStore::open(&path, &config).unwrap();
    assert_eq!(store.count().unwrap(), 2);
  }

  #[test]
  fn test_version_bump_recreates_missing_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let mut config = StoreConfig::default();

    {
      let store = SqliteQueueStore::open(&path, &config).unwrap();
      store
        .lock()
        .unwrap()
        .execute_batch("DROP TABLE pending_orders")
        .unwrap();
    }

    config.version = 2;
    let store = SqliteQueueStore::open(&path, &config).unwrap();
    assert_eq!(store.count().unwrap(), 0);
    store.enqueue(&order(1)).unwrap();
    assert_eq!(store.count().unwrap(), 1);
  }

  #[test]
  fn test_rejects_unsafe_table_name() {
    let config = StoreConfig {
      table: "orders; DROP TABLE x".to_string(),
      ..StoreConfig::default()
    };
    assert!(SqliteQueueStore::open_in_memory(&config).is_err());
  }
}
