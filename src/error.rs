//! Error types for the cache and sync layer.

use thiserror::Error;

/// Result type for Local Store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Local Store failures. Fatal to the current operation only.
#[derive(Debug, Error)]
pub enum StorageError {
  /// Database error from SQLite.
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// Serialization/deserialization error.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// IO error (file system).
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// Connection mutex was poisoned by a panicking writer.
  #[error("storage lock poisoned")]
  LockPoisoned,

  /// A stored row could not be interpreted.
  #[error("invalid data: {0}")]
  InvalidData(String),
}

/// A payload rejected before any local write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("unknown table: {0}")]
  UnknownTable(String),

  #[error("payload for {table} must be a JSON object")]
  NotAnObject { table: String },

  #[error("payload for {table} is missing primary key field '{field}'")]
  MissingPrimaryKey { table: String, field: String },

  #[error("payload for {table} is missing required field '{field}'")]
  MissingField { table: String, field: String },

  #[error("no cached {table} record with id {id}")]
  NotCached { table: String, id: String },
}

/// Failure reported by the Remote Source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// Timeouts, 5xx, connectivity loss. Safe to retry.
  #[error("transient remote error: {0}")]
  Transient(String),

  /// 4xx, conflicts. Retrying will not help.
  #[error("remote rejected request: {0}")]
  Terminal(String),
}

impl RemoteError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  pub fn message(&self) -> &str {
    match self {
      RemoteError::Transient(msg) | RemoteError::Terminal(msg) => msg,
    }
  }
}

/// Errors returned synchronously from `mutate`.
#[derive(Debug, Error)]
pub enum MutationError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Result type for controller and engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the controller, queue and engine.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Storage(#[from] StorageError),

  /// `refresh` called for a key nobody subscribed to.
  #[error("unknown query: {0}")]
  UnknownQuery(String),

  /// No queue item with this sequence id.
  #[error("no sync queue item with sequence id {0}")]
  UnknownItem(u64),

  /// Only items that stopped retrying can be discarded.
  #[error("sync queue item {0} has not failed")]
  NotFailed(u64),
}

impl From<MutationError> for SyncError {
  fn from(err: MutationError) -> Self {
    match err {
      MutationError::Validation(e) => SyncError::Validation(e),
      MutationError::Storage(e) => SyncError::Storage(e),
    }
  }
}
