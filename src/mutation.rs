//! Optimistic local writes handed off to the sync queue.

use chrono::Duration;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{resource_key, BypassTracker, CacheLayer, CachedRecord, LocalStore, Operation, Storage};
use crate::clock::Clock;
use crate::error::{MutationError, StorageError, ValidationError};
use crate::schema::{id_from_value, Schemas, TableSchema};
use crate::sync::SyncQueue;

pub const DEFAULT_BYPASS_WINDOW_MS: i64 = 10_000;

pub struct MutationCoordinator {
  storage: Arc<dyn Storage>,
  cache: CacheLayer,
  queue: Arc<SyncQueue>,
  tracker: Arc<BypassTracker>,
  schemas: Arc<Schemas>,
  clock: Arc<dyn Clock>,
  bypass_window: Duration,
}

impl MutationCoordinator {
  pub fn new(
    storage: Arc<dyn Storage>,
    cache: CacheLayer,
    queue: Arc<SyncQueue>,
    tracker: Arc<BypassTracker>,
    schemas: Arc<Schemas>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      storage,
      cache,
      queue,
      tracker,
      schemas,
      clock,
      bypass_window: Duration::milliseconds(DEFAULT_BYPASS_WINDOW_MS),
    }
  }

  pub fn with_bypass_window(mut self, window: Duration) -> Self {
    self.bypass_window = window;
    self
  }

  /// Apply a write locally and queue it for the remote.
  ///
  /// Returns the optimistic record: the full record for creates and updates,
  /// the removed record (or the given payload if nothing was cached) for
  /// deletes. Invalid payloads are rejected before anything is written.
  pub fn mutate(&self, table: &str, operation: Operation, payload: Value) -> Result<Value, MutationError> {
    let schema = self.schemas.require(table)?;
    if !payload.is_object() {
      return Err(ValidationError::NotAnObject { table: table.to_string() }.into());
    }

    let result = match operation {
      Operation::Create => self.apply_create(schema, payload)?,
      Operation::Update => self.apply_update(schema, payload)?,
      Operation::Delete => self.apply_delete(schema, payload)?,
    };

    let invalidated = self.cache.invalidate_table(table);
    debug!(table, op = %operation, queries = invalidated.len(), "applied local mutation");
    Ok(result)
  }

  pub fn create<T: Serialize>(&self, table: &str, record: &T) -> Result<Value, MutationError> {
    let payload = serde_json::to_value(record).map_err(StorageError::from)?;
    self.mutate(table, Operation::Create, payload)
  }

  /// Merge `patch` into the cached record with the same primary key.
  pub fn update<T: Serialize>(&self, table: &str, patch: &T) -> Result<Value, MutationError> {
    let payload = serde_json::to_value(patch).map_err(StorageError::from)?;
    self.mutate(table, Operation::Update, payload)
  }

  pub fn delete(&self, table: &str, id: &str) -> Result<Value, MutationError> {
    let schema = self.schemas.require(table)?;
    let mut payload = Map::new();
    payload.insert(schema.primary_key.clone(), Value::String(id.to_string()));
    self.mutate(table, Operation::Delete, Value::Object(payload))
  }

  fn apply_create(&self, schema: &TableSchema, mut record: Value) -> Result<Value, MutationError> {
    if let Some(obj) = record.as_object_mut() {
      if !obj.contains_key(&schema.primary_key) {
        obj.insert(schema.primary_key.clone(), Value::String(Uuid::now_v7().to_string()));
      }
    }
    schema.validate(&record)?;
    let id = required_id(schema, &record)?;

    // Queue first: revalidation leaves rows with queued writes alone
    self.queue.enqueue(Operation::Create, &schema.name, &id, record.clone())?;
    self.write_local(schema, id, record.clone())?;
    Ok(record)
  }

  fn apply_update(&self, schema: &TableSchema, patch: Value) -> Result<Value, MutationError> {
    let id = required_id(schema, &patch)?;
    let cached = self
      .storage
      .get(&schema.name, &id)?
      .ok_or_else(|| ValidationError::NotCached {
        table: schema.name.clone(),
        id: id.clone(),
      })?;

    let merged = merge(cached.payload, &patch);
    schema.validate(&merged)?;

    self.queue.enqueue(Operation::Update, &schema.name, &id, patch)?;
    self.write_local(schema, id, merged.clone())?;
    Ok(merged)
  }

  fn apply_delete(&self, schema: &TableSchema, payload: Value) -> Result<Value, MutationError> {
    let id = required_id(schema, &payload)?;

    // Fetches already in flight for anything derived from this record are
    // now stale
    let mut keys = vec![resource_key(&schema.name, &id)];
    keys.extend(self.cache.dependent_keys(&schema.name));
    keys.extend(schema.affects.iter().cloned());
    for key in &keys {
      self.tracker.mark(key, self.bypass_window);
    }
    debug!(table = %schema.name, id = %id, markers = keys.len(), "bypass markers set");

    self.queue.enqueue(Operation::Delete, &schema.name, &id, payload.clone())?;
    let removed = self.storage.delete(&schema.name, &id)?;
    Ok(removed.map_or(payload, |r| r.payload))
  }

  fn write_local(&self, schema: &TableSchema, id: String, payload: Value) -> Result<(), MutationError> {
    self.storage.put(&CachedRecord {
      id,
      table: schema.name.clone(),
      payload,
      fetched_at: self.clock.now(),
    })?;
    Ok(())
  }
}

fn required_id(schema: &TableSchema, payload: &Value) -> Result<String, ValidationError> {
  payload
    .get(&schema.primary_key)
    .and_then(id_from_value)
    .ok_or_else(|| ValidationError::MissingPrimaryKey {
      table: schema.name.clone(),
      field: schema.primary_key.clone(),
    })
}

/// Shallow PATCH merge: top-level fields of `patch` replace those of `base`.
fn merge(mut base: Value, patch: &Value) -> Value {
  if let (Some(target), Some(fields)) = (base.as_object_mut(), patch.as_object()) {
    for (k, v) in fields {
      target.insert(k.clone(), v.clone());
    }
  }
  base
}
