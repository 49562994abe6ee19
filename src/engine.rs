//! Wires the Local Store, remote, cache layer, mutation coordinator and sync
//! queue into one handle, and runs the background drain loop.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
  BypassTracker, CacheLayer, CachedRecord, LocalStore, Operation, QueryDef, Revalidation, SqliteStorage, Storage,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, Config, SyncConfig};
use crate::error::{MutationError, RemoteError, SyncResult};
use crate::mutation::MutationCoordinator;
use crate::query::{QueryOptions, Subscription};
use crate::remote::{HttpRemote, RemoteSource};
use crate::schema::Schemas;
use crate::sync::{DrainReport, SyncQueue, SyncQueueItem};

/// Shortest pause between drain passes, so a misbehaving store cannot spin
/// the loop.
const MIN_IDLE: Duration = Duration::from_millis(50);

pub struct SyncEngine {
  storage: Arc<dyn Storage>,
  remote: Arc<dyn RemoteSource>,
  schemas: Arc<Schemas>,
  cache: CacheLayer,
  mutations: MutationCoordinator,
  queue: Arc<SyncQueue>,
  clock: Arc<dyn Clock>,
  poll_interval: Duration,
}

impl SyncEngine {
  /// Assemble an engine from its parts. Queue items a crashed process left
  /// in flight are put back in line.
  pub fn new<S>(
    storage: Arc<S>,
    remote: Arc<dyn RemoteSource>,
    schemas: Schemas,
    clock: Arc<dyn Clock>,
    cache_config: &CacheConfig,
    sync_config: &SyncConfig,
  ) -> SyncResult<Self>
  where
    S: Storage + 'static,
  {
    let schemas = Arc::new(schemas);
    let tracker = Arc::new(BypassTracker::new(clock.clone()));

    let queue = Arc::new(
      SyncQueue::new(storage.clone(), clock.clone())
        .with_policy(sync_config.retry_policy())
        .with_concurrency(sync_config.concurrency())
        .with_attempt_timeout(sync_config.attempt_timeout()),
    );
    queue.recover_in_flight()?;

    let cache = CacheLayer::new(
      storage.clone(),
      remote.clone(),
      tracker.clone(),
      clock.clone(),
      schemas.clone(),
      cache_config.query_options(),
    );
    let mutations = MutationCoordinator::new(
      storage.clone(),
      cache.clone(),
      queue.clone(),
      tracker,
      schemas.clone(),
      clock.clone(),
    )
    .with_bypass_window(cache_config.bypass_window());

    Ok(Self {
      storage,
      remote,
      schemas,
      cache,
      mutations,
      queue,
      clock,
      poll_interval: sync_config.poll_interval(),
    })
  }

  /// Open the configured SQLite file and HTTP remote.
  pub fn from_config(config: &Config, api_key: Option<&str>) -> SyncResult<Self> {
    let storage = match &config.database_path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    };

    let schemas = Schemas::new(config.tables.iter().cloned());
    let mut remote = HttpRemote::new(
      &config.remote.url,
      api_key,
      Arc::new(schemas.clone()),
      config.request_timeout(),
    )?;
    if let Some(schema) = &config.remote.schema {
      remote = remote.with_schema(schema.as_str());
    }

    Self::new(
      Arc::new(storage),
      Arc::new(remote),
      schemas,
      Arc::new(SystemClock),
      &config.cache,
      &config.sync,
    )
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn schemas(&self) -> &Schemas {
    &self.schemas
  }

  pub fn subscribe<T, F, Fut>(&self, def: QueryDef, query_fn: F, options: QueryOptions) -> SyncResult<Subscription<T>>
  where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Arc<dyn RemoteSource>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>, RemoteError>> + Send + 'static,
  {
    self.cache.subscribe(def, query_fn, options)
  }

  pub fn subscribe_table<T>(&self, def: QueryDef) -> SyncResult<Subscription<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.cache.subscribe_table(def)
  }

  pub async fn refresh(&self, key: &str) -> SyncResult<Revalidation> {
    self.cache.refresh(key).await
  }

  pub fn mutate(&self, table: &str, operation: Operation, payload: Value) -> Result<Value, MutationError> {
    self.mutations.mutate(table, operation, payload)
  }

  pub fn create<T: Serialize>(&self, table: &str, record: &T) -> Result<Value, MutationError> {
    self.mutations.create(table, record)
  }

  pub fn update<T: Serialize>(&self, table: &str, patch: &T) -> Result<Value, MutationError> {
    self.mutations.update(table, patch)
  }

  pub fn delete(&self, table: &str, id: &str) -> Result<Value, MutationError> {
    self.mutations.delete(table, id)
  }

  /// Writes for `table` not yet confirmed by the remote, failed ones included.
  pub fn pending_count(&self, table: &str) -> SyncResult<usize> {
    Ok(self.queue.pending_count(Some(table))?)
  }

  pub fn last_error(&self, table: &str) -> SyncResult<Option<String>> {
    Ok(self.queue.last_error(table)?)
  }

  pub fn failed_items(&self, table: Option<&str>) -> SyncResult<Vec<SyncQueueItem>> {
    Ok(self.queue.failed_items(table)?)
  }

  pub fn retry(&self, sequence_id: u64) -> SyncResult<SyncQueueItem> {
    self.queue.retry(sequence_id)
  }

  /// Drop a failed write and let the remote's version of the record back in.
  pub fn discard(&self, sequence_id: u64) -> SyncResult<SyncQueueItem> {
    let item = self.queue.discard(sequence_id)?;
    self.cache.invalidate_table(&item.table);
    Ok(item)
  }

  /// Drop every cached record and revalidation timestamp. Queued writes are
  /// kept.
  pub fn clear_cache(&self) -> SyncResult<()> {
    self.cache.clear()
  }

  /// Run one drain pass and fold committed records back into the Local Store.
  pub async fn drain_once(&self) -> SyncResult<DrainReport> {
    let report = self.queue.drain(self.remote.as_ref()).await?;

    let mut touched = BTreeSet::new();
    for committed in &report.committed {
      let item = &committed.item;
      touched.insert(item.table.clone());

      if item.operation == Operation::Delete {
        self.cache.note_remote_delete(&item.table, &item.record_id);
        continue;
      }
      if self.queue.has_later_items(item)? {
        continue;
      }

      // Restamp the row so reads that started before the commit leave it be
      let now = self.clock.now();
      let written = match &committed.record {
        Some(record) => Some(CachedRecord {
          id: self
            .schemas
            .id_of(&item.table, record)
            .unwrap_or_else(|| item.record_id.clone()),
          table: item.table.clone(),
          payload: record.clone(),
          fetched_at: now,
        }),
        None => self.storage.get(&item.table, &item.record_id)?.map(|cached| CachedRecord {
          fetched_at: now,
          ..cached
        }),
      };
      if let Some(record) = written {
        self.storage.put(&record)?;
      }
    }
    for table in touched.iter().chain(report.failed.iter().map(|i| &i.table)) {
      self.cache.notify_table(table);
    }

    if !report.is_idle() {
      info!(
        committed = report.committed.len(),
        retried = report.retried.len(),
        failed = report.failed.len(),
        remaining = report.remaining,
        "sync pass finished"
      );
    }
    Ok(report)
  }

  /// Spawn the background drain loop. It wakes on every enqueue, when the
  /// next backed-off item is due, and at least every poll interval.
  pub fn start(self: &Arc<Self>) -> SyncHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let engine = self.clone();

    let task = tokio::spawn(async move {
      info!(poll_ms = engine.poll_interval.as_millis() as u64, "sync loop started");
      loop {
        if let Err(e) = engine.drain_once().await {
          warn!(error = %e, "sync pass failed");
        }

        let idle = match engine.queue.next_due_in() {
          Ok(Some(due)) => due.clamp(MIN_IDLE, engine.poll_interval.max(MIN_IDLE)),
          Ok(None) => engine.poll_interval,
          Err(e) => {
            warn!(error = %e, "could not read sync queue");
            engine.poll_interval
          }
        };
        debug!(idle_ms = idle.as_millis() as u64, "sync loop idle");

        tokio::select! {
          _ = engine.queue.woken() => {}
          _ = tokio::time::sleep(idle) => {}
          _ = stop.changed() => break,
        }
      }
      info!("sync loop stopped");
    });

    SyncHandle { shutdown, task }
  }
}

/// Handle to the background drain loop.
pub struct SyncHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl SyncHandle {
  /// Stop the loop after its current pass and wait for it.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.task.await {
      warn!(error = %e, "sync loop ended abnormally");
    }
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Filter, QueueStore};
  use crate::clock::ManualClock;
  use crate::remote::fake::{Fault, FakeRemote};
  use crate::schema::TableSchema;
  use crate::sync::ItemState;
  use serde_json::json;

  fn engine_with(storage: Arc<SqliteStorage>, remote: Arc<FakeRemote>, clock: ManualClock) -> SyncEngine {
    let sync = SyncConfig {
      jitter_ratio: 0.0,
      ..SyncConfig::default()
    };
    SyncEngine::new(
      storage,
      remote,
      Schemas::new([TableSchema::new("workout_sessions").required(&["user_id"])]),
      Arc::new(clock),
      &CacheConfig::default(),
      &sync,
    )
    .unwrap()
  }

  fn engine() -> (ManualClock, Arc<SqliteStorage>, Arc<FakeRemote>, SyncEngine) {
    let clock = ManualClock::default();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let remote = FakeRemote::new();
    let engine = engine_with(storage.clone(), remote.clone(), clock.clone());
    (clock, storage, remote, engine)
  }

  #[tokio::test]
  async fn test_offline_create_syncs_when_drained() {
    let (_clock, storage, remote, engine) = engine();
    let record = engine
      .create("workout_sessions", &json!({"user_id": "u1", "name": "Push"}))
      .unwrap();
    let id = record["id"].as_str().unwrap().to_string();

    assert_eq!(engine.pending_count("workout_sessions").unwrap(), 1);
    assert!(remote.rows("workout_sessions").is_empty());

    let report = engine.drain_once().await.unwrap();
    assert_eq!(report.committed.len(), 1);
    assert_eq!(engine.pending_count("workout_sessions").unwrap(), 0);
    assert_eq!(remote.rows("workout_sessions")[0]["id"], id.as_str());
    assert!(storage.get("workout_sessions", &id).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_committed_record_written_back() {
    let (_clock, storage, remote, engine) = engine();
    remote.insert("workout_sessions", json!({"id": "s1", "user_id": "u1", "name": "Legs", "volume": 900}));
    storage
      .put(&CachedRecord {
        id: "s1".into(),
        table: "workout_sessions".into(),
        payload: json!({"id": "s1", "user_id": "u1", "name": "Legs"}),
        fetched_at: chrono::Utc::now(),
      })
      .unwrap();

    engine.update("workout_sessions", &json!({"id": "s1", "name": "Leg day"})).unwrap();
    engine.drain_once().await.unwrap();

    // Server-computed fields arrive with the commit
    let cached = storage.get("workout_sessions", "s1").unwrap().unwrap();
    assert_eq!(cached.payload["volume"], 900);
    assert_eq!(cached.payload["name"], "Leg day");
  }

  #[tokio::test]
  async fn test_status_surfaces_failures() {
    let (_clock, _storage, remote, engine) = engine();
    remote.fail_next_write(Fault::Fail(RemoteError::Terminal("409 conflict".into())));
    engine
      .create("workout_sessions", &json!({"id": "s9", "user_id": "u1"}))
      .unwrap();

    let report = engine.drain_once().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(engine.last_error("workout_sessions").unwrap().unwrap().contains("409"));
    assert_eq!(engine.pending_count("workout_sessions").unwrap(), 1);

    let failed = engine.failed_items(None).unwrap();
    assert_eq!(failed[0].state, ItemState::Failed);

    engine.discard(failed[0].sequence_id).unwrap();
    assert_eq!(engine.pending_count("workout_sessions").unwrap(), 0);
    assert_eq!(engine.last_error("workout_sessions").unwrap(), None);
  }

  #[tokio::test]
  async fn test_restart_resumes_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = ManualClock::default();
    let remote = FakeRemote::new();

    {
      let storage = Arc::new(SqliteStorage::open(&path).unwrap());
      let engine = engine_with(storage.clone(), remote.clone(), clock.clone());
      engine
        .create("workout_sessions", &json!({"id": "s1", "user_id": "u1"}))
        .unwrap();
      // Crash mid-attempt
      let mut item = storage.load_items().unwrap().remove(0);
      item.state = ItemState::InFlight;
      storage.save_item(&item).unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let engine = engine_with(storage.clone(), remote.clone(), clock);
    assert!(storage.get("workout_sessions", "s1").unwrap().is_some());
    assert_eq!(storage.load_items().unwrap()[0].state, ItemState::Pending);

    engine.drain_once().await.unwrap();
    assert_eq!(remote.rows("workout_sessions").len(), 1);
  }

  #[tokio::test]
  async fn test_background_loop_drains_on_enqueue() {
    let (_clock, _storage, remote, engine) = engine();
    let engine = Arc::new(engine);
    let handle = engine.start();

    engine
      .create("workout_sessions", &json!({"id": "s1", "user_id": "u1"}))
      .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
      while remote.rows("workout_sessions").is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("write reached the remote");

    handle.shutdown().await;
    assert_eq!(engine.pending_count("workout_sessions").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_subscribers_see_commit() {
    let (_clock, _storage, remote, engine) = engine();
    let _gate = remote.hold_queries();
    let mut sub = engine
      .subscribe_table::<Value>(QueryDef::new("mine", "workout_sessions").with_filter(Filter::new().eq("user_id", "u1")))
      .unwrap();
    assert!(sub.recv().await.unwrap().is_empty());

    engine
      .create("workout_sessions", &json!({"id": "s1", "user_id": "u1"}))
      .unwrap();
    assert_eq!(sub.recv().await.unwrap().len(), 1);

    engine.drain_once().await.unwrap();
    let after_commit = sub.latest().unwrap();
    assert_eq!(after_commit.len(), 1);
  }

  fn seed(storage: &SqliteStorage, remote: &FakeRemote, clock: &ManualClock, row: Value) {
    storage
      .put(&CachedRecord {
        id: row["id"].as_str().unwrap().to_string(),
        table: "workout_sessions".into(),
        payload: row.clone(),
        fetched_at: clock.now(),
      })
      .unwrap();
    remote.insert("workout_sessions", row);
  }

  /// Wait for a revalidation of `key` to apply, then give the other released
  /// fetches time to land.
  async fn settle(engine: &SyncEngine, key: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while engine.cache().is_stale(key) != Some(false) {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
    })
    .await
    .expect("revalidation applied");
    tokio::time::sleep(Duration::from_millis(50)).await;
  }

  #[tokio::test]
  async fn test_committed_update_survives_older_fetch() {
    let (clock, storage, remote, engine) = engine();
    seed(&storage, &remote, &clock, json!({"id": "s1", "user_id": "u1", "name": "Legs"}));
    let gate = remote.hold_queries();

    let mut sub = engine
      .subscribe_table::<Value>(QueryDef::new("mine", "workout_sessions"))
      .unwrap();
    assert_eq!(sub.recv().await.unwrap().records[0].payload["name"], "Legs");

    // Both the subscribe fetch and the post-update refresh see the old row
    engine
      .update("workout_sessions", &json!({"id": "s1", "name": "Leg day"}))
      .unwrap();
    while remote.query_count() < 2 {
      tokio::task::yield_now().await;
    }

    engine.drain_once().await.unwrap();
    assert_eq!(remote.rows("workout_sessions")[0]["name"], "Leg day");

    remote.release_hold();
    gate.add_permits(2);
    settle(&engine, "mine").await;

    let mut emitted = 0;
    while let Some(result) = sub.try_recv() {
      assert_eq!(result.records[0].payload["name"], "Leg day", "rendered pre-mutation state");
      emitted += 1;
    }
    assert!(emitted >= 3);
    assert_eq!(
      storage.get("workout_sessions", "s1").unwrap().unwrap().payload["name"],
      "Leg day"
    );
  }

  #[tokio::test]
  async fn test_committed_delete_survives_fetch_after_bypass_window() {
    let (clock, storage, remote, engine) = engine();
    seed(&storage, &remote, &clock, json!({"id": "s1", "user_id": "u1"}));
    seed(&storage, &remote, &clock, json!({"id": "s2", "user_id": "u1"}));
    let gate = remote.hold_queries();

    let mut sub = engine
      .subscribe_table::<Value>(QueryDef::new("mine", "workout_sessions"))
      .unwrap();
    assert_eq!(sub.recv().await.unwrap().len(), 2);

    engine.delete("workout_sessions", "s1").unwrap();
    while remote.query_count() < 2 {
      tokio::task::yield_now().await;
    }
    engine.drain_once().await.unwrap();
    assert_eq!(remote.rows("workout_sessions").len(), 1);

    // The held fetches still carry s1 and resolve once the markers expired
    clock.advance(chrono::Duration::seconds(11));
    remote.release_hold();
    gate.add_permits(2);
    settle(&engine, "mine").await;

    assert!(storage.get("workout_sessions", "s1").unwrap().is_none());
    while let Some(result) = sub.try_recv() {
      assert!(!result.ids().any(|id| id == "s1"), "deleted row came back");
    }
  }

  #[tokio::test]
  async fn test_fetch_after_commit_applies_server_rows() {
    let (clock, storage, remote, engine) = engine();
    seed(&storage, &remote, &clock, json!({"id": "s1", "user_id": "u1", "name": "Legs"}));
    engine
      .update("workout_sessions", &json!({"id": "s1", "name": "Leg day"}))
      .unwrap();
    engine.drain_once().await.unwrap();

    // Someone else edits the row later on
    remote.insert("workout_sessions", json!({"id": "s1", "user_id": "u1", "name": "Squats"}));
    clock.advance(chrono::Duration::seconds(1));

    let mut sub = engine
      .subscribe_table::<Value>(QueryDef::new("mine", "workout_sessions"))
      .unwrap();
    sub.recv().await.unwrap();
    let fresh = sub.recv().await.unwrap();
    assert!(!fresh.is_stale);
    assert_eq!(fresh.records[0].payload["name"], "Squats");
  }
}
