//! Local-first cache and mutation sync for a remote relational backend.
//!
//! Reads are served from a SQLite-backed Local Store and revalidated in the
//! background ([`cache::CacheLayer`]). Writes land locally first and are
//! replayed to the remote in per-record order by the [`sync::SyncQueue`].
//! [`SyncEngine`] wires the pieces together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod query;
pub mod remote;
pub mod schema;
pub mod sync;

pub use engine::{SyncEngine, SyncHandle};
pub use error::{MutationError, RemoteError, StorageError, SyncError, ValidationError};
