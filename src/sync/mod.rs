//! Write side: queued remote mutations and their retry policy.

pub mod backoff;
pub mod item;
mod queue;

pub use backoff::RetryPolicy;
pub use item::{ItemState, SyncQueueItem};
pub use queue::{CommittedItem, DrainReport, SyncQueue, DEFAULT_CONCURRENCY, MAX_CONCURRENCY};
