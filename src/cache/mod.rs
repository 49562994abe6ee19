//! Local-first caching layer.
//!
//! This module provides the read side of the engine:
//! - Persists remote rows in a Local Store (SQLite)
//! - Serves subscribers from the Local Store before the remote answers
//! - Revalidates in the background and re-emits on every change
//! - Discards fetches that started before a recent local mutation

mod bypass;
mod layer;
mod storage;
mod traits;

pub use bypass::{BypassMarker, BypassTracker};
pub use layer::{CacheLayer, Revalidation};
pub use storage::{LocalStore, QueueStore, SqliteStorage, Storage};
pub use traits::{
  compare_values, resource_key, CachedRecord, CompareOp, Condition, Filter, Operation, OrderBy, QueryDef,
  QueryResult,
};
