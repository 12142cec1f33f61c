//! Event envelopes and identity
//!
//! - [`EventType`]: closed catalogue of event types, subjects and schema versions
//! - [`MarketEvent`]: validated, immutable market event
//! - [`canonical_json`]: deterministic JSON rendering used for hashing
//! - [`derive_key`]: deterministic idempotency key derivation

pub mod canonical;
pub mod envelope;
pub mod idempotency;
pub mod payloads;

pub use canonical::canonical_json;
pub use envelope::{EventPayload, EventType, MarketEvent, DLQ_PREFIX};
pub use idempotency::{derive_key, resolve_key, IdempotencyError, INGEST_LOCAL_FIELDS};
pub use payloads::{
    ContractShape, ContractUpdate, MarketLifecycle, MarketStatus, QuoteUpdate, SpotTick,
};
