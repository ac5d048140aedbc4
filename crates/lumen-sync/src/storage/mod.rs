//! Durable local storage
//!
//! Persists each project's document to SQLite: a compact snapshot plus an
//! append-only log of updates, compacted back into a snapshot once the log
//! grows past the configured threshold. The persistence provider replays
//! stored state into the document on startup and streams new updates into
//! the log from then on.

mod error;
mod persistence;
mod schema;

pub use error::{StorageError, StorageResult};
pub use persistence::{PersistenceProvider, UpdateStore};
pub use schema::{get_schema_version, init_schema, needs_init, SCHEMA_VERSION};
