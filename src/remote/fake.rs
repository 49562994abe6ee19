//! In-memory remote used by tests: scriptable faults, held queries, and
//! idempotency-key deduplication.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::{RemoteSource, RemoteWrite};
use crate::cache::{Filter, Operation};
use crate::error::RemoteError;
use crate::schema::id_from_value;

/// What the next write should do instead of succeeding normally.
#[derive(Debug, Clone)]
pub enum Fault {
  /// Reject without applying.
  Fail(RemoteError),
  /// Apply, then lose the response (the ambiguous-timeout case).
  ApplyThenFail(RemoteError),
}

#[derive(Default)]
struct State {
  tables: HashMap<String, BTreeMap<String, Value>>,
  applied: HashMap<String, Option<Value>>,
  log: Vec<(Operation, String, String)>,
  write_faults: VecDeque<Fault>,
  query_faults: VecDeque<RemoteError>,
}

#[derive(Default)]
pub struct FakeRemote {
  state: Mutex<State>,
  hold: Mutex<Option<Arc<Semaphore>>>,
  queries: AtomicUsize,
  writes: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  /// Seed a row directly on the "server".
  pub fn insert(&self, table: &str, row: Value) {
    let id = row.get("id").and_then(id_from_value).expect("seed rows need an id");
    self
      .state()
      .tables
      .entry(table.to_string())
      .or_default()
      .insert(id, row);
  }

  /// Drop a row on the "server" behind the client's back.
  pub fn remove(&self, table: &str, id: &str) {
    if let Some(rows) = self.state().tables.get_mut(table) {
      rows.remove(id);
    }
  }

  pub fn rows(&self, table: &str) -> Vec<Value> {
    self
      .state()
      .tables
      .get(table)
      .map(|t| t.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Committed writes in the order the server applied them.
  pub fn log(&self) -> Vec<(Operation, String, String)> {
    self.state().log.clone()
  }

  pub fn fail_next_write(&self, fault: Fault) {
    self.state().write_faults.push_back(fault);
  }

  pub fn fail_next_query(&self, err: RemoteError) {
    self.state().query_faults.push_back(err);
  }

  /// Make subsequent queries snapshot their rows and then wait until
  /// released. Never releasing simulates a remote that never answers.
  pub fn hold_queries(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.hold.lock().unwrap() = Some(gate.clone());
    gate
  }

  /// Stop holding new queries. Already-held ones still need a permit.
  pub fn release_hold(&self) {
    *self.hold.lock().unwrap() = None;
  }

  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn apply(state: &mut State, write: &RemoteWrite<'_>) -> Result<Option<Value>, RemoteError> {
    let table = state.tables.entry(write.table.to_string()).or_default();
    let committed = match write.operation {
      Operation::Create => {
        table.insert(write.record_id.to_string(), write.payload.clone());
        Some(write.payload.clone())
      }
      Operation::Update => {
        let existing = table
          .get_mut(write.record_id)
          .ok_or_else(|| RemoteError::Terminal(format!("{} not found", write.record_id)))?;
        if let (Some(target), Some(patch)) = (existing.as_object_mut(), write.payload.as_object()) {
          for (k, v) in patch {
            target.insert(k.clone(), v.clone());
          }
        }
        Some(existing.clone())
      }
      Operation::Delete => {
        table.remove(write.record_id);
        None
      }
    };
    state.log.push((
      write.operation,
      write.table.to_string(),
      write.record_id.to_string(),
    ));
    state
      .applied
      .insert(write.idempotency_key.to_string(), committed.clone());
    Ok(committed)
  }
}

#[async_trait]
impl RemoteSource for FakeRemote {
  async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, RemoteError> {
    self.queries.fetch_add(1, Ordering::SeqCst);
    let rows = {
      let mut state = self.state();
      if let Some(err) = state.query_faults.pop_front() {
        return Err(err);
      }
      state
        .tables
        .get(table)
        .map(|t| t.values().filter(|r| filter.matches(r)).cloned().collect::<Vec<_>>())
        .unwrap_or_default()
    };

    let gate = self.hold.lock().unwrap().clone();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
    Ok(rows)
  }

  async fn mutate(&self, write: RemoteWrite<'_>) -> Result<Option<Value>, RemoteError> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    let mut state = self.state();

    // Replayed write: answer with the original outcome
    if let Some(previous) = state.applied.get(write.idempotency_key) {
      return Ok(previous.clone());
    }

    match state.write_faults.pop_front() {
      Some(Fault::Fail(err)) => Err(err),
      Some(Fault::ApplyThenFail(err)) => {
        Self::apply(&mut state, &write)?;
        Err(err)
      }
      None => Self::apply(&mut state, &write),
    }
  }
}
