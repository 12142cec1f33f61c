//! Store abstraction and the items that flow through it

use crate::data::DeadLetterRecord;
use crate::events::MarketEvent;
use crate::records::{EdgeSnapshot, OpportunityDecision};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding: {0}")]
    Encode(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("commit failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("persistence channel closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One unit of work for the writer
#[derive(Debug, Clone, PartialEq)]
pub enum PersistItem {
    /// Validated inbound event, consumed at `offset`
    Event {
        event: MarketEvent,
        offset: Option<u64>,
    },
    /// Inbound envelope that failed validation
    DeadLetter {
        record: DeadLetterRecord,
        offset: Option<u64>,
    },
    Edge(EdgeSnapshot),
    Decision(OpportunityDecision),
}

impl PersistItem {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistItem::Event { .. } => "event",
            PersistItem::DeadLetter { .. } => "dead_letter",
            PersistItem::Edge(_) => "edge_snapshot",
            PersistItem::Decision(_) => "opportunity_decision",
        }
    }

    /// Stream offset the item was consumed at, if it came from the stream
    pub fn offset(&self) -> Option<u64> {
        match self {
            PersistItem::Event { offset, .. } | PersistItem::DeadLetter { offset, .. } => *offset,
            PersistItem::Edge(_) | PersistItem::Decision(_) => None,
        }
    }
}

/// Highest stream offset among `items`
pub fn highest_offset(items: &[PersistItem]) -> Option<u64> {
    items.iter().filter_map(PersistItem::offset).max()
}

/// Per-batch result counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
}

impl BatchOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.duplicates + self.dead_lettered
    }
}

/// Running totals of the persistence service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub retries: u64,
    /// Items still queued when the shutdown grace ran out
    pub abandoned: u64,
}

impl PersistenceStats {
    pub fn record_batch(&mut self, outcome: &BatchOutcome) {
        self.processed += outcome.total();
        self.inserted += outcome.inserted;
        self.duplicates += outcome.duplicates;
        self.dead_lettered += outcome.dead_lettered;
        self.batches += 1;
    }
}

/// Transactional storage
///
/// `commit_batch` is all-or-nothing: either every item and the offset are
/// durable, or nothing is and the caller may retry the whole batch. Applying
/// the same batch twice is safe; every write is keyed.
pub trait EventStore: Send + 'static {
    fn commit_batch(
        &mut self,
        items: &[PersistItem],
        offset: Option<(&str, u64)>,
    ) -> Result<BatchOutcome, StorageError>;

    fn committed_offset(&self, stream: &str) -> Result<Option<u64>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spot_tick_envelope, validated};

    #[test]
    fn test_highest_offset_ignores_records() {
        let event = validated(spot_tick_envelope("BTC-USD", 1, 1.0, Some(1)));
        let items = vec![
            PersistItem::Event {
                event: event.clone(),
                offset: Some(4),
            },
            PersistItem::Event {
                event,
                offset: Some(9),
            },
        ];
        assert_eq!(highest_offset(&items), Some(9));
        assert_eq!(highest_offset(&[]), None);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = PersistenceStats::default();
        stats.record_batch(&BatchOutcome {
            inserted: 3,
            duplicates: 1,
            dead_lettered: 1,
        });
        stats.record_batch(&BatchOutcome::default());
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.batches, 2);
    }
}
