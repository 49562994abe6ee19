//! Sync queue item and its lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::Operation;

/// Where an item is in its lifecycle. Committed items are removed from the
/// queue, so there is no variant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
  /// Waiting for its first attempt
  Pending,
  /// A remote call is outstanding
  InFlight,
  /// Failed retryably; next attempt at `next_attempt_at`
  Retrying,
  /// Failed terminally; kept for surfacing and manual retry
  Failed,
}

impl ItemState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ItemState::Pending => "pending",
      ItemState::InFlight => "in_flight",
      ItemState::Retrying => "retrying",
      ItemState::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(ItemState::Pending),
      "in_flight" => Some(ItemState::InFlight),
      "retrying" => Some(ItemState::Retrying),
      "failed" => Some(ItemState::Failed),
      _ => None,
    }
  }

  /// Still on the active drain path.
  pub fn is_active(&self) -> bool {
    !matches!(self, ItemState::Failed)
  }
}

/// A pending remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
  pub sequence_id: u64,
  pub operation: Operation,
  pub table: String,
  pub record_id: String,
  pub payload: Value,
  /// Sent with every attempt so the remote can drop duplicate applies
  pub idempotency_key: String,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub state: ItemState,
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
  /// Ready for an attempt at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    match self.state {
      ItemState::Pending => true,
      ItemState::Retrying => self.next_attempt_at.map_or(true, |at| at <= now),
      ItemState::InFlight | ItemState::Failed => false,
    }
  }

  pub fn record_key(&self) -> (&str, &str) {
    (&self.table, &self.record_id)
  }
}

/// Fields supplied when enqueueing; the store assigns the sequence id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
  pub operation: Operation,
  pub table: String,
  pub record_id: String,
  pub payload: Value,
  pub idempotency_key: String,
  pub enqueued_at: DateTime<Utc>,
}

impl NewQueueItem {
  pub fn new(
    operation: Operation,
    table: impl Into<String>,
    record_id: impl Into<String>,
    payload: Value,
    enqueued_at: DateTime<Utc>,
  ) -> Self {
    let table = table.into();
    let record_id = record_id.into();
    let idempotency_key = idempotency_key(operation, &table, &record_id, &payload, enqueued_at);
    Self {
      operation,
      table,
      record_id,
      payload,
      idempotency_key,
      enqueued_at,
    }
  }
}

/// Stable key for one logical write: identical for every resend of the same
/// item, distinct for two writes of the same record.
pub fn idempotency_key(
  operation: Operation,
  table: &str,
  record_id: &str,
  payload: &Value,
  enqueued_at: DateTime<Utc>,
) -> String {
  let mut hasher = Sha256::new();
  hasher.update(operation.as_str().as_bytes());
  hasher.update(b"\0");
  hasher.update(table.as_bytes());
  hasher.update(b"\0");
  hasher.update(record_id.as_bytes());
  hasher.update(b"\0");
  hasher.update(payload.to_string().as_bytes());
  hasher.update(b"\0");
  hasher.update(
    enqueued_at
      .timestamp_nanos_opt()
      .unwrap_or_default()
      .to_be_bytes(),
  );
  hex::encode(hasher.finalize())
}
