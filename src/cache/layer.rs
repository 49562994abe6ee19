//! Cache layer that serves from the Local Store and revalidates against the
//! remote in the background.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::bypass::BypassTracker;
use super::storage::{LocalStore, QueueStore, Storage};
use super::traits::{resource_key, CachedRecord, QueryDef, QueryResult};
use crate::clock::Clock;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::query::{Listener, LoadingWatchdog, QueryOptions, Subscription};
use crate::remote::RemoteSource;
use crate::schema::Schemas;

/// Fresh fetches started in a row because results kept predating mutations.
const MAX_BYPASS_REFETCHES: usize = 5;

type QueryFn =
  Arc<dyn Fn(Arc<dyn RemoteSource>) -> BoxFuture<'static, Result<Vec<Value>, RemoteError>> + Send + Sync>;

/// What happened to one revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidation {
  /// Rows written and subscribers notified
  Applied,
  /// A newer fetch of the same query was already applied
  Superseded,
  /// Every fetch predated a recent mutation; nothing applied
  Bypassed,
}

struct QueryEntry {
  def: QueryDef,
  options: QueryOptions,
  query_fn: QueryFn,
  state: Mutex<EntryState>,
}

#[derive(Default)]
struct EntryState {
  listeners: Vec<Box<dyn Listener>>,
  last_revalidated_at: Option<DateTime<Utc>>,
  /// Start time of the most recently applied fetch
  applied_started_at: Option<DateTime<Utc>>,
  stale: bool,
  /// Set when cached rows are known to lag the remote, so the persisted
  /// revalidation time must not count as fresh
  invalidated: bool,
  last_error: Option<String>,
  watchdog: Option<LoadingWatchdog>,
}

impl QueryEntry {
  fn lock(&self) -> MutexGuard<'_, EntryState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Deletes the remote confirmed, held while a fetch that started before them
/// may still land.
#[derive(Default)]
struct Tombstones {
  deleted: HashMap<String, DateTime<Utc>>,
  /// Start times of fetches still running
  fetches: BTreeMap<DateTime<Utc>, usize>,
}

impl Tombstones {
  fn hides(&self, key: &str, started_at: DateTime<Utc>) -> bool {
    self.deleted.get(key).is_some_and(|at| *at >= started_at)
  }

  /// Forget deletes that no running fetch predates.
  fn prune(&mut self) {
    match self.fetches.keys().next().copied() {
      Some(oldest) => self.deleted.retain(|_, at| oldest <= *at),
      None => self.deleted.clear(),
    }
  }
}

/// A running fetch, registered until dropped.
struct FetchGuard<'a> {
  tombstones: &'a Mutex<Tombstones>,
  started_at: DateTime<Utc>,
}

impl<'a> FetchGuard<'a> {
  fn begin(tombstones: &'a Mutex<Tombstones>, clock: &dyn Clock) -> Self {
    let mut guard = tombstones.lock().unwrap_or_else(|e| e.into_inner());
    let started_at = clock.now();
    *guard.fetches.entry(started_at).or_insert(0) += 1;
    Self { tombstones, started_at }
  }
}

impl Drop for FetchGuard<'_> {
  fn drop(&mut self) {
    let mut guard = self.tombstones.lock().unwrap_or_else(|e| e.into_inner());
    if let Entry::Occupied(mut running) = guard.fetches.entry(self.started_at) {
      *running.get_mut() -= 1;
      if *running.get() == 0 {
        running.remove();
      }
    }
    guard.prune();
  }
}

struct Inner {
  storage: Arc<dyn Storage>,
  remote: Arc<dyn RemoteSource>,
  tracker: Arc<BypassTracker>,
  clock: Arc<dyn Clock>,
  schemas: Arc<Schemas>,
  defaults: QueryOptions,
  queries: Mutex<HashMap<String, Arc<QueryEntry>>>,
  tombstones: Mutex<Tombstones>,
}

/// Cache-and-revalidate controller.
///
/// Cheap to clone; clones share the same query registry.
#[derive(Clone)]
pub struct CacheLayer {
  inner: Arc<Inner>,
}

impl CacheLayer {
  pub fn new(
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteSource>,
    tracker: Arc<BypassTracker>,
    clock: Arc<dyn Clock>,
    schemas: Arc<Schemas>,
    defaults: QueryOptions,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        remote,
        tracker,
        clock,
        schemas,
        defaults,
        queries: Mutex::new(HashMap::new()),
        tombstones: Mutex::new(Tombstones::default()),
      }),
    }
  }

  /// Options used by [`CacheLayer::subscribe_table`].
  pub fn default_options(&self) -> QueryOptions {
    self.inner.defaults
  }

  /// Subscribe to a query whose rows come from `query_fn`.
  ///
  /// The first result (cached rows) is queued before this returns. Unless the
  /// cache is fresh per `options.stale_after`, a background revalidation
  /// starts, bounded for the subscriber by the loading watchdog.
  ///
  /// Subscribing to a key that is already registered reuses its definition
  /// and fetcher.
  pub fn subscribe<T, F, Fut>(
    &self,
    def: QueryDef,
    query_fn: F,
    options: QueryOptions,
  ) -> SyncResult<Subscription<T>>
  where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Arc<dyn RemoteSource>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>, RemoteError>> + Send + 'static,
  {
    let query_fn: QueryFn = Arc::new(move |remote| query_fn(remote).boxed());
    let entry = self.register(def, query_fn, options);
    let (subscription, listener) = Subscription::<T>::channel(&entry.def.key);

    let now = self.inner.clock.now();
    let persisted = self.inner.storage.last_revalidated(&entry.def.key)?;
    let revalidate = {
      let mut state = entry.lock();
      if state.last_revalidated_at.is_none() {
        state.last_revalidated_at = persisted;
      }
      let stale_after = chrono::Duration::from_std(entry.options.stale_after).unwrap_or(chrono::Duration::MAX);
      let fresh = !state.invalidated
        && state
          .last_revalidated_at
          .is_some_and(|at| now - at < stale_after);
      state.stale = !fresh;

      // First emission goes to the new subscriber only
      let result = self.read_local(&entry, &state, false)?;
      listener.deliver(&result);
      state.listeners.push(Box::new(listener));
      !fresh
    };

    if revalidate {
      self.spawn_revalidation(entry, true);
    } else {
      debug!(key = %entry.def.key, "cache fresh, skipping revalidation");
    }

    Ok(subscription)
  }

  /// Subscribe with the default options, fetching `def.table` rows matching
  /// `def.filter` from the remote.
  pub fn subscribe_table<T>(&self, def: QueryDef) -> SyncResult<Subscription<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let table = def.table.clone();
    let filter = def.filter.clone();
    self.subscribe(
      def,
      move |remote| {
        let table = table.clone();
        let filter = filter.clone();
        async move { remote.query(&table, &filter).await }
      },
      self.inner.defaults,
    )
  }

  /// Re-run revalidation for a registered query and wait for it.
  pub async fn refresh(&self, key: &str) -> SyncResult<Revalidation> {
    let entry = self
      .entry(key)
      .ok_or_else(|| SyncError::UnknownQuery(key.to_string()))?;
    self.run_revalidation(entry).await
  }

  /// Start a refresh in the background.
  pub fn schedule_refresh(&self, key: &str) -> SyncResult<()> {
    let entry = self
      .entry(key)
      .ok_or_else(|| SyncError::UnknownQuery(key.to_string()))?;
    self.spawn_revalidation(entry, false);
    Ok(())
  }

  /// Keys of registered queries that derive from `table`.
  pub fn dependent_keys(&self, table: &str) -> Vec<String> {
    self
      .entries_depending_on(table)
      .iter()
      .map(|e| e.def.key.clone())
      .collect()
  }

  /// Mark every query deriving from `table` stale, re-emit it from the Local
  /// Store right away, and schedule a refresh for those still subscribed.
  /// Returns the affected keys.
  pub fn invalidate_table(&self, table: &str) -> Vec<String> {
    let entries = self.entries_depending_on(table);
    let mut live = Vec::new();

    for entry in &entries {
      let mut state = entry.lock();
      state.stale = true;
      state.invalidated = true;
      self.broadcast(entry, &mut state, false);
      if !state.listeners.is_empty() {
        live.push(entry.clone());
      }
    }

    for entry in live {
      self.spawn_revalidation(entry, false);
    }

    entries.iter().map(|e| e.def.key.clone()).collect()
  }

  /// Re-emit every query deriving from `table` from the Local Store without
  /// changing its staleness. Used after the sync queue writes back a
  /// committed record.
  pub fn notify_table(&self, table: &str) {
    for entry in self.entries_depending_on(table) {
      let mut state = entry.lock();
      self.broadcast(&entry, &mut state, false);
    }
  }

  /// Record that the remote confirmed deleting `table:id`, so a fetch that
  /// started before now cannot bring the row back.
  pub fn note_remote_delete(&self, table: &str, id: &str) {
    let mut tombstones = self.inner.tombstones.lock().unwrap_or_else(|e| e.into_inner());
    if tombstones.fetches.is_empty() {
      return;
    }
    let at = self.inner.clock.now();
    tombstones.deleted.insert(resource_key(table, id), at);
  }

  /// Drop all cached records and query state, then re-emit (now empty)
  /// results to every subscriber.
  pub fn clear(&self) -> SyncResult<()> {
    self.inner.storage.clear()?;
    for entry in self.all_entries() {
      let mut state = entry.lock();
      state.last_revalidated_at = None;
      state.applied_started_at = None;
      state.stale = true;
      state.invalidated = true;
      self.broadcast(&entry, &mut state, false);
    }
    info!("local cache cleared");
    Ok(())
  }

  /// Whether a registered query is currently considered stale.
  pub fn is_stale(&self, key: &str) -> Option<bool> {
    self.entry(key).map(|e| e.lock().stale)
  }

  fn register(&self, def: QueryDef, query_fn: QueryFn, options: QueryOptions) -> Arc<QueryEntry> {
    let mut queries = self.inner.queries.lock().unwrap_or_else(|e| e.into_inner());
    queries
      .entry(def.key.clone())
      .or_insert_with(|| {
        Arc::new(QueryEntry {
          def,
          options,
          query_fn,
          state: Mutex::new(EntryState {
            stale: true,
            ..EntryState::default()
          }),
        })
      })
      .clone()
  }

  fn entry(&self, key: &str) -> Option<Arc<QueryEntry>> {
    let queries = self.inner.queries.lock().unwrap_or_else(|e| e.into_inner());
    queries.get(key).cloned()
  }

  fn all_entries(&self) -> Vec<Arc<QueryEntry>> {
    let queries = self.inner.queries.lock().unwrap_or_else(|e| e.into_inner());
    queries.values().cloned().collect()
  }

  fn entries_depending_on(&self, table: &str) -> Vec<Arc<QueryEntry>> {
    let queries = self.inner.queries.lock().unwrap_or_else(|e| e.into_inner());
    let mut entries: Vec<_> = queries
      .values()
      .filter(|e| e.def.depends_on(table))
      .cloned()
      .collect();
    entries.sort_by(|a, b| a.def.key.cmp(&b.def.key));
    entries
  }

  /// Build a result from the Local Store.
  fn read_local(&self, entry: &QueryEntry, state: &EntryState, forced: bool) -> SyncResult<QueryResult<Value>> {
    let records = self
      .inner
      .storage
      .get_all(&entry.def.table, &entry.def.filter)?;
    Ok(QueryResult {
      records: entry.def.shape(records),
      last_revalidated_at: state.last_revalidated_at,
      is_stale: state.stale,
      error: state.last_error.clone(),
      forced,
    })
  }

  /// Send the current local view to every live subscriber of `entry`.
  fn broadcast(&self, entry: &QueryEntry, state: &mut EntryState, forced: bool) {
    let result = match self.read_local(entry, state, forced) {
      Ok(result) => result,
      Err(e) => {
        warn!(key = %entry.def.key, error = %e, "failed to read cached rows");
        QueryResult {
          records: Vec::new(),
          last_revalidated_at: state.last_revalidated_at,
          is_stale: true,
          error: Some(e.to_string()),
          forced,
        }
      }
    };
    state.listeners.retain(|l| l.deliver(&result));
  }

  fn spawn_revalidation(&self, entry: Arc<QueryEntry>, with_watchdog: bool) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!(key = %entry.def.key, "no runtime, revalidation not scheduled");
      return;
    };
    let this = self.clone();
    handle.spawn(async move {
      if with_watchdog {
        this.revalidate_with_watchdog(entry).await;
      } else {
        let key = entry.def.key.clone();
        if let Err(e) = this.run_revalidation(entry).await {
          debug!(key = %key, error = %e, "background refresh failed");
        }
      }
    });
  }

  /// Revalidate, force-emitting the cached rows if the fetch outlives the
  /// loading timeout. The fetch itself keeps running.
  async fn revalidate_with_watchdog(&self, entry: Arc<QueryEntry>) {
    let watchdog = LoadingWatchdog::start(entry.options.timeout);
    entry.lock().watchdog = Some(watchdog);

    let key = entry.def.key.clone();
    let fetch = self.run_revalidation(entry.clone());
    tokio::pin!(fetch);

    tokio::select! {
      outcome = &mut fetch => {
        if let Err(e) = outcome {
          debug!(key = %key, error = %e, "revalidation failed");
        }
        return;
      }
      _ = tokio::time::sleep_until(watchdog.deadline()) => {
        let mut state = entry.lock();
        match state.watchdog {
          // Another revalidation of this query already resolved
          None => debug!(key = %key, "query settled before the loading timeout"),
          Some(current) => {
            if current == watchdog || current.expired() {
              state.watchdog = None;
            }
            warn!(key = %key, timeout_ms = watchdog.timeout.as_millis() as u64, "revalidation pending past loading timeout, emitting cached rows");
            state.stale = true;
            state.invalidated = true;
            self.broadcast(&entry, &mut state, true);
          }
        }
      }
    }

    if let Err(e) = fetch.await {
      debug!(key = %key, error = %e, "late revalidation failed");
    }
  }

  async fn run_revalidation(&self, entry: Arc<QueryEntry>) -> SyncResult<Revalidation> {
    for _ in 0..=MAX_BYPASS_REFETCHES {
      let fetch = FetchGuard::begin(&self.inner.tombstones, self.inner.clock.as_ref());
      let started_at = fetch.started_at;
      let fetched = (entry.query_fn)(self.inner.remote.clone()).await;

      let rows = match fetched {
        Ok(rows) => rows,
        Err(err) => {
          warn!(key = %entry.def.key, error = %err, "revalidation failed, keeping cached rows");
          let mut state = entry.lock();
          state.stale = true;
          state.invalidated = true;
          state.last_error = Some(err.to_string());
          state.watchdog = None;
          self.broadcast(&entry, &mut state, false);
          return Err(err.into());
        }
      };

      match self.apply(&entry, rows, started_at)? {
        Revalidation::Bypassed => {
          debug!(key = %entry.def.key, %started_at, "fetch predates a recent mutation, refetching");
        }
        outcome => return Ok(outcome),
      }
    }

    warn!(key = %entry.def.key, "revalidation kept racing mutations, giving up for now");
    Ok(Revalidation::Bypassed)
  }

  /// Reconcile fetched rows into the Local Store.
  fn apply(&self, entry: &QueryEntry, rows: Vec<Value>, started_at: DateTime<Utc>) -> SyncResult<Revalidation> {
    let table = &entry.def.table;
    let tracker = &self.inner.tracker;
    let now = self.inner.clock.now();

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
      match self.inner.schemas.id_of(table, &row) {
        Some(id) => records.push(CachedRecord {
          id,
          table: table.clone(),
          payload: row,
          fetched_at: started_at,
        }),
        None => warn!(table = %table, "remote row without primary key ignored"),
      }
    }

    if tracker.is_bypassed(&entry.def.key, started_at)
      || records
        .iter()
        .any(|r| tracker.is_bypassed(&r.resource_key(), started_at))
    {
      return Ok(Revalidation::Bypassed);
    }

    {
      let mut state = entry.lock();
      if state.applied_started_at.is_some_and(|prev| started_at < prev) {
        debug!(key = %entry.def.key, "dropping result older than the applied one");
        return Ok(Revalidation::Superseded);
      }

      // Local intent wins until the queue commits it, and a commit wins over
      // any snapshot taken before it
      let mut writable = Vec::with_capacity(records.len());
      let tombstones = self.inner.tombstones.lock().unwrap_or_else(|e| e.into_inner());
      for record in records {
        if self.inner.storage.has_queued(table, &record.id)? {
          debug!(table = %table, id = %record.id, "keeping local version with queued writes");
          continue;
        }
        if tombstones.hides(&record.resource_key(), started_at) {
          debug!(table = %table, id = %record.id, "row deleted after this fetch started");
          continue;
        }
        if let Some(local) = self.inner.storage.get(table, &record.id)? {
          if local.fetched_at >= started_at {
            debug!(table = %table, id = %record.id, "keeping local version written after this fetch started");
            continue;
          }
        }
        writable.push(record);
      }
      drop(tombstones);

      self.inner.storage.put_many(&writable)?;
      self
        .inner
        .storage
        .set_last_revalidated(&entry.def.key, table, now)?;

      state.last_revalidated_at = Some(state.last_revalidated_at.map_or(now, |prev| prev.max(now)));
      state.applied_started_at = Some(started_at);
      state.stale = false;
      state.invalidated = false;
      state.last_error = None;
      state.watchdog = None;
      debug!(key = %entry.def.key, rows = writable.len(), "revalidated");
      self.broadcast(entry, &mut state, false);
    }

    // Overlapping queries see the new rows too
    for other in self.entries_depending_on(table) {
      if other.def.key == entry.def.key {
        continue;
      }
      let mut state = other.lock();
      self.broadcast(&other, &mut state, false);
    }

    Ok(Revalidation::Applied)
  }
}
