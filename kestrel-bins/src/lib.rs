//! Kestrel Binaries
//!
//! - `kestrel-pipeline`: run the decision pipeline over a JSONL stream of
//!   envelopes, with checkpoint restore and tail replay
//! - `kestrel-dlq`: inspect, replay and acknowledge dead-letter records

pub mod common;
pub mod driver;
