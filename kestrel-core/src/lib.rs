//! Kestrel Core - Idempotent Decision Pipeline for Binary Event Markets
//!
//! Kestrel turns at-least-once, possibly out-of-order market-event delivery
//! into deterministic trade/no-trade decisions.
//!
//! ## Architecture
//! - **Exactly-once effect** over at-least-once delivery (idempotency keys)
//! - **Monotonic projection** per market, published as immutable snapshots
//! - **Single writer** to durable storage, batched and idempotent
//! - **Fail-safe gate** that suppresses new entries while unhealthy
//!
//! ## Data Flow
//!
//! ```text
//!  envelopes ──▶ EnvelopeValidator ──▶ StateBuilder ──▶ Evaluator (edge + opportunity)
//!                     │                     │                   │
//!                     ▼                     ▼                   ▼
//!                dead-letter        PersistenceService ◀── records
//!                                                               │
//!                            DegradedModeController ◀── health ─┘
//! ```
//!
//! ## Core Modules
//! - `events`: Envelope types, canonical JSON, idempotency keys
//! - `data`: Envelope validation, dead-letter records, two-sided quotes
//! - `state`: State Builder, projection, snapshots, checkpoints
//! - `records`: Edge snapshots and opportunity decisions
//! - `persistence`: Batching single-writer service and the SQLite store
//! - `resilience`: Degraded-mode controller, health line, backoff, shutdown
//! - `engine`: Pipeline wiring with a pluggable [`engine::Evaluator`]

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod persistence;
pub mod records;
pub mod resilience;
pub mod state;
pub mod testing;
pub mod utils;

pub use config::KestrelConfig;
pub use engine::{Evaluation, Evaluator, Pipeline};
pub use error::{PipelineError, RetryPolicy};
pub use events::{EventType, MarketEvent};
pub use records::{EdgeSnapshot, OpportunityDecision, Side, SkipReason};
pub use state::{SnapshotReader, StateBuilder, TradableMarketState};

/// Prelude for convenient imports
pub mod prelude {
    // Events
    pub use crate::events::{EventPayload, EventType, MarketEvent};

    // State
    pub use crate::state::{ApplyOutcome, SnapshotReader, StateBuilder, TradableMarketState};

    // Records
    pub use crate::records::{
        DecisionState, EdgeSnapshot, OpportunityDecision, Side, SigmaSource, SkipReason,
    };

    // Gate
    pub use crate::resilience::{EntryGate, Mode};

    // Error types
    pub use crate::error::{PipelineError, RetryPolicy};
}
