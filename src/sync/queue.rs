//! Durable, per-record ordered queue of pending remote writes.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::item::{ItemState, NewQueueItem, SyncQueueItem};
use crate::cache::{Operation, QueueStore};
use crate::clock::Clock;
use crate::error::{RemoteError, StorageResult, SyncError, SyncResult};
use crate::remote::{RemoteSource, RemoteWrite};

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY: usize = 4;

/// An item the remote acknowledged, with the record it reported back.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedItem {
  pub item: SyncQueueItem,
  pub record: Option<Value>,
}

/// Outcome of one [`SyncQueue::drain`] pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
  /// In commit order
  pub committed: Vec<CommittedItem>,
  /// Attempts that failed retryably and were rescheduled
  pub retried: Vec<SyncQueueItem>,
  /// Items that failed terminally or ran out of attempts during this pass
  pub failed: Vec<SyncQueueItem>,
  /// Items still queued after the pass, failed ones included
  pub remaining: usize,
}

impl DrainReport {
  pub fn is_idle(&self) -> bool {
    self.committed.is_empty() && self.retried.is_empty() && self.failed.is_empty()
  }
}

pub struct SyncQueue {
  store: Arc<dyn QueueStore>,
  clock: Arc<dyn Clock>,
  policy: RetryPolicy,
  concurrency: usize,
  attempt_timeout: Duration,
  wake: Notify,
  draining: Mutex<()>,
}

impl SyncQueue {
  pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      policy: RetryPolicy::default(),
      concurrency: DEFAULT_CONCURRENCY,
      attempt_timeout: Duration::from_millis(10_000),
      wake: Notify::new(),
      draining: Mutex::new(()),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Records synced in parallel, clamped to `1..=4`.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
    self
  }

  pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
    self.attempt_timeout = timeout;
    self
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Persist a write and wake the drain loop.
  pub fn enqueue(
    &self,
    operation: Operation,
    table: &str,
    record_id: &str,
    payload: Value,
  ) -> StorageResult<SyncQueueItem> {
    let item = self.store.insert_item(NewQueueItem::new(
      operation,
      table,
      record_id,
      payload,
      self.clock.now(),
    ))?;
    debug!(seq = item.sequence_id, table, id = record_id, op = %operation, "queued write");
    self.wake.notify_one();
    Ok(item)
  }

  /// Put items a previous process left mid-attempt back in line.
  pub fn recover_in_flight(&self) -> StorageResult<usize> {
    let reset = self.store.reset_in_flight()?;
    if reset > 0 {
      info!(count = reset, "recovered sync items interrupted mid-attempt");
    }
    Ok(reset)
  }

  /// Resolves once something was enqueued or retried since the last wait.
  pub async fn woken(&self) {
    self.wake.notified().await
  }

  /// Send every due item to `remote`, repeating until nothing is due.
  ///
  /// Only the oldest unfinished item of each record is eligible, so writes to
  /// one record commit in enqueue order. Concurrent calls run one at a time.
  pub async fn drain(&self, remote: &dyn RemoteSource) -> StorageResult<DrainReport> {
    let _draining = self.draining.lock().await;
    let mut report = DrainReport::default();

    // No attempt is outstanding between drains; anything still in flight was
    // cut short by a storage error in an earlier pass
    let stranded = self.store.reset_in_flight()?;
    if stranded > 0 {
      warn!(count = stranded, "requeued sync items left in flight by an earlier pass");
    }

    loop {
      let now = self.clock.now();
      let mut batch = eligible_heads(self.store.load_items()?, now);
      if batch.is_empty() {
        break;
      }

      for item in &mut batch {
        item.state = ItemState::InFlight;
        self.store.save_item(item)?;
      }
      debug!(items = batch.len(), concurrency = self.concurrency, "draining sync queue");

      let outcomes: Vec<_> = stream::iter(batch)
        .map(|item| async move {
          let outcome = self.attempt(remote, &item).await;
          (item, outcome)
        })
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

      for (item, outcome) in outcomes {
        self.settle(item, outcome, &mut report)?;
      }
    }

    report.remaining = self.store.load_items()?.len();
    Ok(report)
  }

  async fn attempt(&self, remote: &dyn RemoteSource, item: &SyncQueueItem) -> Result<Option<Value>, RemoteError> {
    let write = RemoteWrite {
      table: &item.table,
      operation: item.operation,
      record_id: &item.record_id,
      payload: &item.payload,
      idempotency_key: &item.idempotency_key,
    };
    match tokio::time::timeout(self.attempt_timeout, remote.mutate(write)).await {
      Ok(outcome) => outcome,
      Err(_) => Err(RemoteError::Transient(format!(
        "no response within {} ms",
        self.attempt_timeout.as_millis()
      ))),
    }
  }

  fn settle(
    &self,
    mut item: SyncQueueItem,
    outcome: Result<Option<Value>, RemoteError>,
    report: &mut DrainReport,
  ) -> StorageResult<()> {
    match outcome {
      Ok(record) => {
        self.store.remove_item(item.sequence_id)?;
        info!(seq = item.sequence_id, table = %item.table, id = %item.record_id, op = %item.operation, "committed");
        report.committed.push(CommittedItem { item, record });
      }
      Err(err) => {
        item.attempts += 1;
        item.last_error = Some(err.to_string());

        if err.is_retryable() && !self.policy.exhausted(item.attempts) {
          let delay = self.policy.delay(item.attempts);
          item.state = ItemState::Retrying;
          item.next_attempt_at = Some(self.clock.now() + delay);
          warn!(
            seq = item.sequence_id,
            table = %item.table,
            attempts = item.attempts,
            retry_in_ms = delay.num_milliseconds(),
            error = %err,
            "sync attempt failed, will retry"
          );
          self.store.save_item(&item)?;
          report.retried.push(item);
        } else {
          item.state = ItemState::Failed;
          item.next_attempt_at = None;
          error!(
            seq = item.sequence_id,
            table = %item.table,
            id = %item.record_id,
            attempts = item.attempts,
            error = %err,
            "sync item failed"
          );
          self.store.save_item(&item)?;
          report.failed.push(item);
        }
      }
    }
    Ok(())
  }

  /// Uncommitted items, failed ones included, optionally for one table.
  pub fn pending_count(&self, table: Option<&str>) -> StorageResult<usize> {
    Ok(
      self
        .store
        .load_items()?
        .iter()
        .filter(|i| table.map_or(true, |t| i.table == t))
        .count(),
    )
  }

  /// Most recent failure recorded for an item of `table`.
  pub fn last_error(&self, table: &str) -> StorageResult<Option<String>> {
    Ok(
      self
        .store
        .load_items()?
        .into_iter()
        .rev()
        .filter(|i| i.table == table)
        .find_map(|i| i.last_error),
    )
  }

  pub fn items(&self) -> StorageResult<Vec<SyncQueueItem>> {
    self.store.load_items()
  }

  pub fn failed_items(&self, table: Option<&str>) -> StorageResult<Vec<SyncQueueItem>> {
    Ok(
      self
        .store
        .load_items()?
        .into_iter()
        .filter(|i| i.state == ItemState::Failed && table.map_or(true, |t| i.table == t))
        .collect(),
    )
  }

  /// Whether items after `item` are queued for the same record.
  pub fn has_later_items(&self, item: &SyncQueueItem) -> StorageResult<bool> {
    Ok(self.store.load_items()?.iter().any(|other| {
      other.sequence_id > item.sequence_id && other.record_key() == item.record_key()
    }))
  }

  /// Make a failed or backing-off item due now, with a fresh attempt budget.
  pub fn retry(&self, sequence_id: u64) -> SyncResult<SyncQueueItem> {
    let mut item = self
      .store
      .load_item(sequence_id)?
      .ok_or(SyncError::UnknownItem(sequence_id))?;

    if matches!(item.state, ItemState::Failed | ItemState::Retrying) {
      item.state = ItemState::Pending;
      item.attempts = 0;
      item.next_attempt_at = None;
      self.store.save_item(&item)?;
      info!(seq = sequence_id, table = %item.table, "sync item requeued");
      self.wake.notify_one();
    }
    Ok(item)
  }

  /// Drop a failed item without sending it. The local optimistic state is
  /// left as is.
  pub fn discard(&self, sequence_id: u64) -> SyncResult<SyncQueueItem> {
    let item = self
      .store
      .load_item(sequence_id)?
      .ok_or(SyncError::UnknownItem(sequence_id))?;
    if item.state != ItemState::Failed {
      return Err(SyncError::NotFailed(sequence_id));
    }
    self.store.remove_item(sequence_id)?;
    info!(seq = sequence_id, table = %item.table, id = %item.record_id, "sync item discarded");
    Ok(item)
  }

  /// Time until the earliest backing-off item becomes due. `Some(ZERO)` when
  /// something is due now, `None` when nothing is waiting.
  pub fn next_due_in(&self) -> StorageResult<Option<Duration>> {
    let now = self.clock.now();
    let items = self.store.load_items()?;
    let mut earliest: Option<DateTime<Utc>> = None;

    for head in heads(&items) {
      let due_at = match head.state {
        ItemState::Pending => now,
        ItemState::Retrying => head.next_attempt_at.unwrap_or(now),
        ItemState::InFlight | ItemState::Failed => continue,
      };
      earliest = Some(earliest.map_or(due_at, |e| e.min(due_at)));
    }

    Ok(earliest.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)))
  }
}

/// Oldest non-failed item per record, in sequence order.
fn heads(items: &[SyncQueueItem]) -> Vec<&SyncQueueItem> {
  let mut seen = HashSet::new();
  items
    .iter()
    .filter(|item| item.state.is_active())
    .filter(|item| seen.insert(item.record_key()))
    .collect()
}

/// Heads that may be attempted at `now`.
fn eligible_heads(items: Vec<SyncQueueItem>, now: DateTime<Utc>) -> Vec<SyncQueueItem> {
  let eligible: HashSet<u64> = heads(&items)
    .into_iter()
    .filter(|item| item.is_due(now))
    .map(|item| item.sequence_id)
    .collect();
  items
    .into_iter()
    .filter(|item| eligible.contains(&item.sequence_id))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::clock::ManualClock;
  use crate::remote::fake::{Fault, FakeRemote};
  use serde_json::json;

  fn queue() -> (ManualClock, Arc<SqliteStorage>, SyncQueue) {
    let clock = ManualClock::default();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let queue = SyncQueue::new(storage.clone(), Arc::new(clock.clone())).with_policy(RetryPolicy {
      jitter_ratio: 0.0,
      ..RetryPolicy::default()
    });
    (clock, storage, queue)
  }

  fn transient() -> Fault {
    Fault::Fail(RemoteError::Transient("503".into()))
  }

  #[tokio::test]
  async fn test_update_then_delete_commit_in_order_across_retries() {
    let (clock, _storage, queue) = queue();
    let remote = FakeRemote::new();
    remote.insert("workout_sessions", json!({"id": "s1", "name": "Legs"}));

    queue
      .enqueue(Operation::Update, "workout_sessions", "s1", json!({"id": "s1", "name": "Leg day"}))
      .unwrap();
    queue
      .enqueue(Operation::Delete, "workout_sessions", "s1", json!({"id": "s1"}))
      .unwrap();

    remote.fail_next_write(transient());
    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert!(report.committed.is_empty());
    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.remaining, 2);
    // The Delete waits behind the backing-off Update
    assert_eq!(remote.write_count(), 1);

    clock.advance(chrono::Duration::seconds(1));
    remote.fail_next_write(transient());
    queue.drain(remote.as_ref()).await.unwrap();

    clock.advance(chrono::Duration::seconds(2));
    let report = queue.drain(remote.as_ref()).await.unwrap();
    let ops: Vec<_> = report.committed.iter().map(|c| c.item.operation).collect();
    assert_eq!(ops, vec![Operation::Update, Operation::Delete]);
    assert_eq!(
      remote.log(),
      vec![
        (Operation::Update, "workout_sessions".to_string(), "s1".to_string()),
        (Operation::Delete, "workout_sessions".to_string(), "s1".to_string()),
      ]
    );
    assert_eq!(report.remaining, 0);
  }

  #[tokio::test]
  async fn test_ambiguous_failure_does_not_duplicate_create() {
    let (clock, _storage, queue) = queue();
    let remote = FakeRemote::new();

    queue
      .enqueue(Operation::Create, "sets", "x1", json!({"id": "x1", "reps": 5}))
      .unwrap();
    remote.fail_next_write(Fault::ApplyThenFail(RemoteError::Transient("timeout".into())));

    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.retried.len(), 1);

    clock.advance(chrono::Duration::seconds(5));
    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.committed.len(), 1);
    assert_eq!(report.committed[0].record.as_ref().unwrap()["reps"], 5);
    assert_eq!(remote.rows("sets").len(), 1);
    assert_eq!(remote.log().len(), 1);
    assert_eq!(remote.write_count(), 2);
  }

  #[tokio::test]
  async fn test_terminal_failure_does_not_block_other_records() {
    let (_clock, _storage, queue) = queue();
    let remote = FakeRemote::new();

    let bad = queue
      .enqueue(Operation::Update, "sets", "missing", json!({"id": "missing", "reps": 1}))
      .unwrap();
    queue
      .enqueue(Operation::Create, "sets", "x2", json!({"id": "x2"}))
      .unwrap();
    let after = queue
      .enqueue(Operation::Create, "sets", "missing", json!({"id": "missing"}))
      .unwrap();

    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].sequence_id, bad.sequence_id);
    let committed: Vec<_> = report.committed.iter().map(|c| c.item.sequence_id).collect();
    assert!(committed.contains(&after.sequence_id));
    assert_eq!(report.committed.len(), 2);

    let failed = queue.failed_items(Some("sets")).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("not found"));
    assert_eq!(queue.pending_count(Some("sets")).unwrap(), 1);
    assert!(queue.last_error("sets").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_retries_exhaust_into_failed() {
    let (clock, _storage, queue) = queue();
    let queue = queue.with_policy(RetryPolicy {
      base: chrono::Duration::milliseconds(10),
      cap: chrono::Duration::milliseconds(10),
      jitter_ratio: 0.0,
      max_attempts: 3,
    });
    let remote = FakeRemote::new();
    for _ in 0..3 {
      remote.fail_next_write(transient());
    }
    let item = queue.enqueue(Operation::Create, "sets", "x1", json!({"id": "x1"})).unwrap();

    for _ in 0..3 {
      queue.drain(remote.as_ref()).await.unwrap();
      clock.advance(chrono::Duration::milliseconds(10));
    }

    let stored = queue.items().unwrap().remove(0);
    assert_eq!(stored.sequence_id, item.sequence_id);
    assert_eq!(stored.state, ItemState::Failed);
    assert_eq!(stored.attempts, 3);
    assert_eq!(queue.next_due_in().unwrap(), None);
  }

  #[tokio::test]
  async fn test_backoff_schedules_next_attempt() {
    let (clock, _storage, queue) = queue();
    let remote = FakeRemote::new();
    remote.fail_next_write(transient());
    queue.enqueue(Operation::Create, "sets", "x1", json!({"id": "x1"})).unwrap();

    assert_eq!(queue.next_due_in().unwrap(), Some(Duration::ZERO));
    let report = queue.drain(remote.as_ref()).await.unwrap();
    let retried = &report.retried[0];
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.state, ItemState::Retrying);
    assert_eq!(retried.next_attempt_at, Some(clock.now() + chrono::Duration::seconds(1)));
    assert_eq!(queue.next_due_in().unwrap(), Some(Duration::from_secs(1)));

    // Not due yet: nothing is sent
    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert!(report.is_idle());
    assert_eq!(remote.write_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_attempt_timeout_is_retryable() {
    struct Silent;

    #[async_trait::async_trait]
    impl RemoteSource for Silent {
      async fn query(&self, _: &str, _: &crate::cache::Filter) -> Result<Vec<Value>, RemoteError> {
        Ok(Vec::new())
      }

      async fn mutate(&self, _: RemoteWrite<'_>) -> Result<Option<Value>, RemoteError> {
        futures::future::pending().await
      }
    }

    let (_clock, _storage, queue) = queue();
    let queue = queue.with_attempt_timeout(Duration::from_millis(250));
    queue.enqueue(Operation::Create, "sets", "x1", json!({"id": "x1"})).unwrap();

    let report = queue.drain(&Silent).await.unwrap();
    assert_eq!(report.retried.len(), 1);
    assert!(report.retried[0].last_error.as_deref().unwrap().contains("250 ms"));
  }

  #[tokio::test]
  async fn test_in_flight_items_recovered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = ManualClock::default();

    {
      let storage = Arc::new(SqliteStorage::open(&path).unwrap());
      let queue = SyncQueue::new(storage.clone(), Arc::new(clock.clone()));
      let mut item = queue.enqueue(Operation::Create, "sets", "x1", json!({"id": "x1"})).unwrap();
      item.state = ItemState::InFlight;
      storage.save_item(&item).unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let queue = SyncQueue::new(storage, Arc::new(clock));
    assert_eq!(queue.recover_in_flight().unwrap(), 1);

    let remote = FakeRemote::new();
    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.committed.len(), 1);
  }

  #[tokio::test]
  async fn test_drain_requeues_items_stranded_in_flight() {
    let (_clock, storage, queue) = queue();
    let mut item = queue.enqueue(Operation::Create, "sets", "x1", json!({"id": "x1"})).unwrap();
    // An earlier pass that failed to settle its batch left the head in flight
    item.state = ItemState::InFlight;
    storage.save_item(&item).unwrap();
    queue
      .enqueue(Operation::Update, "sets", "x1", json!({"id": "x1", "reps": 5}))
      .unwrap();
    assert_eq!(queue.next_due_in().unwrap(), None);

    let remote = FakeRemote::new();
    let report = queue.drain(remote.as_ref()).await.unwrap();
    let ops: Vec<_> = report.committed.iter().map(|c| c.item.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update]);
    assert_eq!(report.remaining, 0);
    assert_eq!(remote.rows("sets")[0]["reps"], 5);
  }

  #[tokio::test]
  async fn test_retry_and_discard_failed_items() {
    let (_clock, _storage, queue) = queue();
    let remote = FakeRemote::new();
    remote.fail_next_write(Fault::Fail(RemoteError::Terminal("422".into())));
    remote.fail_next_write(Fault::Fail(RemoteError::Terminal("422".into())));
    let a = queue.enqueue(Operation::Create, "sets", "a", json!({"id": "a"})).unwrap();
    let b = queue.enqueue(Operation::Create, "sets", "b", json!({"id": "b"})).unwrap();
    queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(queue.failed_items(None).unwrap().len(), 2);

    assert!(matches!(queue.discard(999), Err(SyncError::UnknownItem(999))));
    queue.discard(b.sequence_id).unwrap();

    let requeued = queue.retry(a.sequence_id).unwrap();
    assert_eq!(requeued.state, ItemState::Pending);
    assert_eq!(requeued.attempts, 0);
    assert!(matches!(queue.discard(a.sequence_id), Err(SyncError::NotFailed(_))));

    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.committed.len(), 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(remote.rows("sets").len(), 1);
  }

  #[tokio::test]
  async fn test_unrelated_records_sync_concurrently() {
    let (_clock, _storage, queue) = queue();
    let queue = queue.with_concurrency(16);
    assert_eq!(queue.concurrency(), MAX_CONCURRENCY);

    let remote = FakeRemote::new();
    for i in 0..6 {
      let id = format!("x{}", i);
      queue.enqueue(Operation::Create, "sets", &id, json!({"id": id.clone()})).unwrap();
    }
    let first = queue.items().unwrap()[0].clone();
    queue.enqueue(Operation::Update, "sets", "x0", json!({"id": "x0", "reps": 8})).unwrap();
    assert!(queue.has_later_items(&first).unwrap());

    let report = queue.drain(remote.as_ref()).await.unwrap();
    assert_eq!(report.committed.len(), 7);
    let x0: Vec<_> = report
      .committed
      .iter()
      .filter(|c| c.item.record_id == "x0")
      .map(|c| c.item.operation)
      .collect();
    assert_eq!(x0, vec![Operation::Create, Operation::Update]);
    assert_eq!(remote.rows("sets").len(), 6);
  }

  #[test]
  fn test_heads_skip_failed_items() {
    let now = Utc::now();
    let item = |seq: u64, id: &str, state: ItemState| SyncQueueItem {
      sequence_id: seq,
      operation: Operation::Update,
      table: "sets".into(),
      record_id: id.into(),
      payload: json!({}),
      idempotency_key: seq.to_string(),
      enqueued_at: now,
      attempts: 0,
      last_error: None,
      state,
      next_attempt_at: None,
    };
    let items = vec![
      item(1, "a", ItemState::Failed),
      item(2, "a", ItemState::Pending),
      item(3, "a", ItemState::Pending),
      item(4, "b", ItemState::Retrying),
      item(5, "c", ItemState::InFlight),
      item(6, "c", ItemState::Pending),
    ];
    let seqs: Vec<_> = eligible_heads(items, now).iter().map(|i| i.sequence_id).collect();
    assert_eq!(seqs, vec![2, 4]);
  }
}
