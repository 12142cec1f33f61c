//! Dead-letter replay
//!
//! A record is re-validated with the current validator. If it passes, the
//! event is written through the normal insert path (so its idempotency key
//! still dedups it) and the record is acknowledged in the same transaction.
//! If it still fails, the record stays as it is.

use super::store::{BatchOutcome, EventStore, StorageError};
use crate::data::{DeadLetterStore, EnvelopeValidator, ValidationError};
use crate::events::MarketEvent;
use tracing::info;

/// Stores that can resolve a dead-letter record atomically
pub trait ReplayStore: EventStore + DeadLetterStore<Error = StorageError> {
    /// Commit `event` and acknowledge record `id`, both or neither
    fn commit_replayed(&mut self, event: MarketEvent, id: i64) -> Result<BatchOutcome, StorageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    NotFound,
    Replayed { idempotency_key: String, inserted: bool },
    StillInvalid(ValidationError),
}

pub fn replay_dead_letter<S: ReplayStore>(
    store: &mut S,
    validator: &EnvelopeValidator,
    id: i64,
) -> Result<ReplayOutcome, StorageError> {
    let Some(record) = store.dead_letter(id)? else {
        return Ok(ReplayOutcome::NotFound);
    };

    let event = match validator.validate(&record.envelope) {
        Ok(event) => event,
        Err(e) => return Ok(ReplayOutcome::StillInvalid(e)),
    };

    let idempotency_key = event.idempotency_key.clone();
    let outcome = store.commit_replayed(event, id)?;

    info!(id, %idempotency_key, inserted = outcome.inserted, "dead-letter replayed");
    Ok(ReplayOutcome::Replayed {
        idempotency_key,
        inserted: outcome.inserted > 0,
    })
}
