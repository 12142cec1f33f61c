//! Durable storage of events, records and dead-letters
//!
//! - [`EventStore`]: transactional batch commit, the only write path
//! - [`SqliteStore`]: the production store
//! - [`PersistenceService`]: async single writer with batching and retry
//! - [`PersistSink`]: how producers hand items to the writer

pub mod batch;
pub mod replay;
pub mod service;
pub mod sink;
pub mod sqlite;
pub mod store;

pub use batch::{Batch, BatchPolicy};
pub use replay::{replay_dead_letter, ReplayOutcome, ReplayStore};
pub use service::{PersistenceHandle, PersistenceService};
pub use sink::PersistSink;
pub use sqlite::SqliteStore;
pub use store::{BatchOutcome, EventStore, PersistItem, PersistenceStats, StorageError};
