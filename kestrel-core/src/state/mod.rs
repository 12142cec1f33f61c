//! Authoritative per-market state
//!
//! - [`StateBuilder`]: sole writer, monotonic apply, checkpoint/restore
//! - [`SnapshotReader`]: read-only handle for everyone else
//! - [`TradableMarketState`]: immutable snapshot with per-field ages

pub mod builder;
pub mod checkpoint;
pub mod projection;
pub mod snapshot;
pub mod stamp;

pub use builder::StateBuilder;
pub use checkpoint::{replay_start, Checkpoint, CheckpointError, CheckpointSchedule};
pub use projection::{HorizonChain, MarketProjection, SpotPoint};
pub use snapshot::{
    age_seconds, ContractView, CoveragePolicy, QuoteView, SnapshotReader, SpotView,
    TradableMarketState,
};
pub use stamp::{ApplyOutcome, FieldStamp};
