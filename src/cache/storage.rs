//! Local Store traits and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::{CachedRecord, Filter, Operation};
use crate::error::{StorageError, StorageResult};
use crate::sync::item::{ItemState, NewQueueItem, SyncQueueItem};

/// Persistent keyed record storage, one logical table per entity type.
pub trait LocalStore: Send + Sync {
  /// Get a single record.
  fn get(&self, table: &str, id: &str) -> StorageResult<Option<CachedRecord>>;

  /// Get every record of a table matching the filter, ordered by id.
  fn get_all(&self, table: &str, filter: &Filter) -> StorageResult<Vec<CachedRecord>>;

  /// Insert or replace a record.
  fn put(&self, record: &CachedRecord) -> StorageResult<()>;

  /// Insert or replace several records atomically.
  fn put_many(&self, records: &[CachedRecord]) -> StorageResult<()>;

  /// Remove a record, returning what was stored.
  fn delete(&self, table: &str, id: &str) -> StorageResult<Option<CachedRecord>>;

  /// When a query last revalidated successfully.
  fn last_revalidated(&self, query_key: &str) -> StorageResult<Option<DateTime<Utc>>>;

  /// Persist a successful revalidation time for a query.
  fn set_last_revalidated(&self, query_key: &str, table: &str, at: DateTime<Utc>) -> StorageResult<()>;

  /// Drop all cached records and query state. The sync queue is untouched.
  fn clear(&self) -> StorageResult<()>;
}

/// Durable storage for the sync queue.
pub trait QueueStore: Send + Sync {
  /// Append an item, assigning the next sequence id.
  fn insert_item(&self, item: NewQueueItem) -> StorageResult<SyncQueueItem>;

  /// All items in sequence order.
  fn load_items(&self) -> StorageResult<Vec<SyncQueueItem>>;

  fn load_item(&self, sequence_id: u64) -> StorageResult<Option<SyncQueueItem>>;

  /// Persist the mutable fields (state, attempts, errors, schedule).
  fn save_item(&self, item: &SyncQueueItem) -> StorageResult<()>;

  fn remove_item(&self, sequence_id: u64) -> StorageResult<bool>;

  /// Whether any queue item (including failed ones) exists for the record.
  fn has_queued(&self, table: &str, id: &str) -> StorageResult<bool>;

  /// Return items left in flight by an interrupted process to pending.
  fn reset_in_flight(&self) -> StorageResult<usize>;
}

/// Everything the cache and sync layer needs from storage.
pub trait Storage: LocalStore + QueueStore {}

impl<T: LocalStore + QueueStore> Storage for T {}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the default location.
  pub fn open_default() -> StorageResult<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    debug!(path = %path.display(), "opened local store");

    Self::with_connection(conn)
  }

  /// A private, non-persistent database.
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

  /// Get the default database path.
  pub fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::InvalidData("could not determine data directory".into()))?;

    Ok(data_dir.join("gymsync").join("cache.db"))
  }

  fn run_migrations(&self) -> StorageResult<()> {
    self.lock()?.execute_batch(SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

/// Schema for cache and queue tables.
const SCHEMA: &str = r#"
-- Cached records (payload is serialized JSON)
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (table_name, record_id)
);

-- Last successful revalidation per query
CREATE TABLE IF NOT EXISTS query_state (
    query_key TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    last_revalidated_at TEXT NOT NULL
);

-- Pending remote writes; AUTOINCREMENT keeps sequence ids monotonic
CREATE TABLE IF NOT EXISTS sync_queue (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    idempotency_key TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    state TEXT NOT NULL DEFAULT 'pending',
    next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_record
    ON sync_queue(table_name, record_id, sequence_id);
"#;

const QUEUE_COLUMNS: &str = "sequence_id, operation, table_name, record_id, payload, idempotency_key, \
   enqueued_at, attempts, last_error, state, next_attempt_at";

impl LocalStore for SqliteStorage {
  fn get(&self, table: &str, id: &str) -> StorageResult<Option<CachedRecord>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT payload, fetched_at FROM records WHERE table_name = ? AND record_id = ?",
        params![table, id],
        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
      )
      .optional()?;

    match row {
      Some((data, fetched_at)) => Ok(Some(CachedRecord {
        id: id.to_string(),
        table: table.to_string(),
        payload: serde_json::from_slice(&data)?,
        fetched_at: parse_datetime(&fetched_at)?,
      })),
      None => Ok(None),
    }
  }

  fn get_all(&self, table: &str, filter: &Filter) -> StorageResult<Vec<CachedRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT record_id, payload, fetched_at FROM records
       WHERE table_name = ?
       ORDER BY record_id",
    )?;

    let rows = stmt
      .query_map(params![table], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (id, data, fetched_at) in rows {
      let payload: Value = match serde_json::from_slice(&data) {
        Ok(v) => v,
        Err(e) => {
          warn!(table, id = %id, error = %e, "skipping unreadable cached record");
          continue;
        }
      };
      if !filter.matches(&payload) {
        continue;
      }
      records.push(CachedRecord {
        id,
        table: table.to_string(),
        payload,
        fetched_at: parse_datetime(&fetched_at)?,
      });
    }

    Ok(records)
  }

  fn put(&self, record: &CachedRecord) -> StorageResult<()> {
    let conn = self.lock()?;
    insert_record(&conn, record)
  }

  fn put_many(&self, records: &[CachedRecord]) -> StorageResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for record in records {
      insert_record(&tx, record)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn delete(&self, table: &str, id: &str) -> StorageResult<Option<CachedRecord>> {
    let existing = self.get(table, id)?;
    if existing.is_some() {
      self.lock()?.execute(
        "DELETE FROM records WHERE table_name = ? AND record_id = ?",
        params![table, id],
      )?;
    }
    Ok(existing)
  }

  fn last_revalidated(&self, query_key: &str) -> StorageResult<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let at: Option<String> = conn
      .query_row(
        "SELECT last_revalidated_at FROM query_state WHERE query_key = ?",
        params![query_key],
        |row| row.get(0),
      )
      .optional()?;
    at.as_deref().map(parse_datetime).transpose()
  }

  fn set_last_revalidated(&self, query_key: &str, table: &str, at: DateTime<Utc>) -> StorageResult<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO query_state (query_key, table_name, last_revalidated_at)
       VALUES (?, ?, ?)",
      params![query_key, table, format_datetime(at)],
    )?;
    Ok(())
  }

  fn clear(&self) -> StorageResult<()> {
    self
      .lock()?
      .execute_batch("DELETE FROM records; DELETE FROM query_state;")?;
    Ok(())
  }
}

impl QueueStore for SqliteStorage {
  fn insert_item(&self, item: NewQueueItem) -> StorageResult<SyncQueueItem> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO sync_queue (operation, table_name, record_id, payload, idempotency_key, enqueued_at, state)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        item.operation.as_str(),
        item.table,
        item.record_id,
        serde_json::to_vec(&item.payload)?,
        item.idempotency_key,
        format_datetime(item.enqueued_at),
        ItemState::Pending.as_str(),
      ],
    )?;
    let sequence_id = conn.last_insert_rowid() as u64;

    Ok(SyncQueueItem {
      sequence_id,
      operation: item.operation,
      table: item.table,
      record_id: item.record_id,
      payload: item.payload,
      idempotency_key: item.idempotency_key,
      enqueued_at: item.enqueued_at,
      attempts: 0,
      last_error: None,
      state: ItemState::Pending,
      next_attempt_at: None,
    })
  }

  fn load_items(&self) -> StorageResult<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM sync_queue ORDER BY sequence_id",
      QUEUE_COLUMNS
    ))?;
    let raw = stmt
      .query_map([], RawQueueRow::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawQueueRow::into_item).collect()
  }

  fn load_item(&self, sequence_id: u64) -> StorageResult<Option<SyncQueueItem>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM sync_queue WHERE sequence_id = ?", QUEUE_COLUMNS),
        params![sequence_id as i64],
        RawQueueRow::from_row,
      )
      .optional()?;
    raw.map(RawQueueRow::into_item).transpose()
  }

  fn save_item(&self, item: &SyncQueueItem) -> StorageResult<()> {
    self.lock()?.execute(
      "UPDATE sync_queue
       SET attempts = ?, last_error = ?, state = ?, next_attempt_at = ?
       WHERE sequence_id = ?",
      params![
        item.attempts,
        item.last_error,
        item.state.as_str(),
        item.next_attempt_at.map(format_datetime),
        item.sequence_id as i64,
      ],
    )?;
    Ok(())
  }

  fn remove_item(&self, sequence_id: u64) -> StorageResult<bool> {
    let removed = self.lock()?.execute(
      "DELETE FROM sync_queue WHERE sequence_id = ?",
      params![sequence_id as i64],
    )?;
    Ok(removed > 0)
  }

  fn has_queued(&self, table: &str, id: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM sync_queue WHERE table_name = ? AND record_id = ?",
      params![table, id],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  fn reset_in_flight(&self) -> StorageResult<usize> {
    let reset = self.lock()?.execute(
      "UPDATE sync_queue SET state = ? WHERE state = ?",
      params![ItemState::Pending.as_str(), ItemState::InFlight.as_str()],
    )?;
    Ok(reset)
  }
}

fn insert_record(conn: &Connection, record: &CachedRecord) -> StorageResult<()> {
  conn.execute(
    "INSERT OR REPLACE INTO records (table_name, record_id, payload, fetched_at)
     VALUES (?, ?, ?, ?)",
    params![
      record.table,
      record.id,
      serde_json::to_vec(&record.payload)?,
      format_datetime(record.fetched_at),
    ],
  )?;
  Ok(())
}

/// Queue row as read from SQLite, before parsing enums and timestamps.
struct RawQueueRow {
  sequence_id: i64,
  operation: String,
  table: String,
  record_id: String,
  payload: Vec<u8>,
  idempotency_key: String,
  enqueued_at: String,
  attempts: u32,
  last_error: Option<String>,
  state: String,
  next_attempt_at: Option<String>,
}

impl RawQueueRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence_id: row.get(0)?,
      operation: row.get(1)?,
      table: row.get(2)?,
      record_id: row.get(3)?,
      payload: row.get(4)?,
      idempotency_key: row.get(5)?,
      enqueued_at: row.get(6)?,
      attempts: row.get(7)?,
      last_error: row.get(8)?,
      state: row.get(9)?,
      next_attempt_at: row.get(10)?,
    })
  }

  fn into_item(self) -> StorageResult<SyncQueueItem> {
    let operation = Operation::parse(&self.operation)
      .ok_or_else(|| StorageError::InvalidData(format!("unknown operation '{}'", self.operation)))?;
    let state = ItemState::parse(&self.state)
      .ok_or_else(|| StorageError::InvalidData(format!("unknown queue state '{}'", self.state)))?;

    Ok(SyncQueueItem {
      sequence_id: self.sequence_id as u64,
      operation,
      table: self.table,
      record_id: self.record_id,
      payload: serde_json::from_slice(&self.payload)?,
      idempotency_key: self.idempotency_key,
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      attempts: self.attempts,
      last_error: self.last_error,
      state,
      next_attempt_at: self.next_attempt_at.as_deref().map(parse_datetime).transpose()?,
    })
  }
}

fn format_datetime(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> StorageResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::InvalidData(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn record(table: &str, id: &str, payload: Value) -> CachedRecord {
    CachedRecord {
      id: id.to_string(),
      table: table.to_string(),
      payload,
      fetched_at: Utc::now(),
    }
  }

  #[test]
  fn test_put_get_delete() {
    let store = SqliteStorage::open_in_memory().unwrap();
    let rec = record("sessions", "s1", json!({"id": "s1", "name": "Push"}));

    store.put(&rec).unwrap();
    assert_eq!(store.get("sessions", "s1").unwrap(), Some(rec.clone()));
    assert_eq!(store.get("gyms", "s1").unwrap(), None);

    assert_eq!(store.delete("sessions", "s1").unwrap(), Some(rec));
    assert_eq!(store.get("sessions", "s1").unwrap(), None);
    assert_eq!(store.delete("sessions", "s1").unwrap(), None);
  }

  #[test]
  fn test_get_all_filters_by_table_and_payload() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .put_many(&[
        record("sessions", "s1", json!({"id": "s1", "user_id": "u1"})),
        record("sessions", "s2", json!({"id": "s2", "user_id": "u2"})),
        record("gyms", "g1", json!({"id": "g1", "user_id": "u1"})),
      ])
      .unwrap();

    let all = store.get_all("sessions", &Filter::new()).unwrap();
    assert_eq!(all.len(), 2);

    let mine = store.get_all("sessions", &Filter::new().eq("user_id", "u1")).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, "s1");
  }

  #[test]
  fn test_records_and_queue_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let now = Utc::now();

    {
      let store = SqliteStorage::open(&path).unwrap();
      store.put(&record("sessions", "s1", json!({"id": "s1"}))).unwrap();
      store.set_last_revalidated("recent", "sessions", now).unwrap();
      store
        .insert_item(NewQueueItem::new(Operation::Create, "sessions", "s1", json!({"id": "s1"}), now))
        .unwrap();
    }

    let store = SqliteStorage::open(&path).unwrap();
    assert!(store.get("sessions", "s1").unwrap().is_some());
    assert_eq!(store.last_revalidated("recent").unwrap(), Some(now));
    let items = store.load_items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].enqueued_at, now);
    assert!(store.has_queued("sessions", "s1").unwrap());
  }

  #[test]
  fn test_queue_sequence_ids_are_monotonic() {
    let store = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    let first = store
      .insert_item(NewQueueItem::new(Operation::Update, "sets", "5", json!({"id": 5}), now))
      .unwrap();
    assert!(store.remove_item(first.sequence_id).unwrap());

    let second = store
      .insert_item(NewQueueItem::new(Operation::Delete, "sets", "5", json!({"id": 5}), now))
      .unwrap();
    assert!(second.sequence_id > first.sequence_id);
    assert!(!store.remove_item(first.sequence_id).unwrap());
  }

  #[test]
  fn test_save_item_and_reset_in_flight() {
    let store = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    let mut item = store
      .insert_item(NewQueueItem::new(Operation::Create, "sets", "1", json!({"id": 1}), now))
      .unwrap();

    item.state = ItemState::Retrying;
    item.attempts = 2;
    item.last_error = Some("503".into());
    item.next_attempt_at = Some(now + Duration::seconds(4));
    store.save_item(&item).unwrap();
    assert_eq!(store.load_item(item.sequence_id).unwrap(), Some(item.clone()));

    item.state = ItemState::InFlight;
    store.save_item(&item).unwrap();
    assert_eq!(store.reset_in_flight().unwrap(), 1);
    assert_eq!(
      store.load_item(item.sequence_id).unwrap().map(|i| i.state),
      Some(ItemState::Pending)
    );
  }

  #[test]
  fn test_clear_keeps_queue() {
    let store = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    store.put(&record("sessions", "s1", json!({"id": "s1"}))).unwrap();
    store.set_last_revalidated("recent", "sessions", now).unwrap();
    store
      .insert_item(NewQueueItem::new(Operation::Create, "sessions", "s1", json!({"id": "s1"}), now))
      .unwrap();

    store.clear().unwrap();
    assert!(store.get_all("sessions", &Filter::new()).unwrap().is_empty());
    assert_eq!(store.last_revalidated("recent").unwrap(), None);
    assert_eq!(store.load_items().unwrap().len(), 1);
  }
}
