//! The backend of record, seen as a black box returning rows or an error.

mod http;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{Filter, Operation};
use crate::error::RemoteError;

pub use http::HttpRemote;

/// One write sent to the remote.
#[derive(Debug, Clone, Copy)]
pub struct RemoteWrite<'a> {
  pub table: &'a str,
  pub operation: Operation,
  pub record_id: &'a str,
  pub payload: &'a Value,
  /// Identical across resends of the same queued write
  pub idempotency_key: &'a str,
}

/// Query/mutate interface to the backend.
///
/// Implementations must tolerate a write being resent with the same
/// idempotency key after an ambiguous failure.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  /// Fetch rows of `table` matching `filter`.
  async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, RemoteError>;

  /// Apply a write. Returns the committed record when the backend reports one.
  async fn mutate(&self, write: RemoteWrite<'_>) -> Result<Option<Value>, RemoteError>;
}
