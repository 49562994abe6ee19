//! Query subscriptions.
//!
//! A [`Subscription`] is the consumer end of a cached query: a stream of
//! [`QueryResult`]s that starts with whatever the Local Store holds and
//! follows every revalidation, invalidation and watchdog fire after that.
//!
//! # Example
//!
//! ```ignore
//! let def = QueryDef::new("recent_sessions", "workout_sessions")
//!     .with_filter(Filter::new().eq("user_id", user))
//!     .order_by(OrderBy::desc("started_at"))
//!     .limit(20);
//! let mut sub = cache.subscribe_table::<Session>(def)?;
//!
//! // Cached rows, available immediately
//! let first = sub.try_recv();
//!
//! // In the event loop
//! while let Some(result) = sub.recv().await {
//!     render(&result.records, result.is_stale);
//! }
//! ```

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::cache::QueryResult;

/// Per-subscription policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// Cached data younger than this is served without revalidating.
  /// Zero means always revalidate on subscribe.
  pub stale_after: Duration,
  /// Bound on how long a subscriber waits for revalidation before the cached
  /// (possibly empty) rows are force-emitted
  pub timeout: Duration,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_after: Duration::ZERO,
      timeout: Duration::from_millis(15_000),
    }
  }
}

impl QueryOptions {
  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

/// Deadline for one in-flight subscribe-time revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingWatchdog {
  pub started_at: Instant,
  pub timeout: Duration,
}

impl LoadingWatchdog {
  pub fn start(timeout: Duration) -> Self {
    Self {
      started_at: Instant::now(),
      timeout,
    }
  }

  pub fn deadline(&self) -> Instant {
    self.started_at + self.timeout
  }

  pub fn expired(&self) -> bool {
    Instant::now() >= self.deadline()
  }
}

/// Receiving half handed to the cache layer, type-erased over `T`.
pub(crate) trait Listener: Send + Sync {
  /// Deliver a result. Returns false once the subscriber is gone.
  fn deliver(&self, result: &QueryResult<Value>) -> bool;

  fn is_closed(&self) -> bool;
}

pub(crate) struct TypedListener<T> {
  tx: mpsc::UnboundedSender<QueryResult<T>>,
}

impl<T> Listener for TypedListener<T>
where
  T: DeserializeOwned + Send + 'static,
{
  fn deliver(&self, result: &QueryResult<Value>) -> bool {
    self.tx.send(decode_result(result)).is_ok()
  }

  fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

/// Decode every record payload, dropping (and logging) those that do not fit
/// `T`.
fn decode_result<T: DeserializeOwned>(result: &QueryResult<Value>) -> QueryResult<T> {
  let records = result
    .records
    .iter()
    .cloned()
    .filter_map(|record| {
      let (table, id) = (record.table.clone(), record.id.clone());
      match record.decode() {
        Ok(decoded) => Some(decoded),
        Err(e) => {
          warn!(table = %table, id = %id, error = %e, "cached record does not match subscriber type");
          None
        }
      }
    })
    .collect();

  QueryResult {
    records,
    last_revalidated_at: result.last_revalidated_at,
    is_stale: result.is_stale,
    error: result.error.clone(),
    forced: result.forced,
  }
}

/// A live query. Dropping it unsubscribes; an in-flight fetch is not
/// cancelled.
pub struct Subscription<T> {
  key: String,
  rx: mpsc::UnboundedReceiver<QueryResult<T>>,
}

impl<T> Subscription<T>
where
  T: DeserializeOwned + Send + 'static,
{
  pub(crate) fn channel(key: &str) -> (Self, TypedListener<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Self {
        key: key.to_string(),
        rx,
      },
      TypedListener { tx },
    )
  }
}

impl<T> Subscription<T> {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Wait for the next result.
  pub async fn recv(&mut self) -> Option<QueryResult<T>> {
    self.rx.recv().await
  }

  /// Take the next result if one is already queued.
  pub fn try_recv(&mut self) -> Option<QueryResult<T>> {
    self.rx.try_recv().ok()
  }

  /// Skip to the most recent queued result.
  pub fn latest(&mut self) -> Option<QueryResult<T>> {
    let mut latest = None;
    while let Ok(result) = self.rx.try_recv() {
      latest = Some(result);
    }
    latest
  }

  /// Stop receiving results.
  pub fn unsubscribe(mut self) {
    self.rx.close();
  }
}

impl<T> Stream for Subscription<T> {
  type Item = QueryResult<T>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}

impl<T> std::fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}
