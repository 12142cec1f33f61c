//! Evaluator trait
//!
//! The pipeline is generic over its evaluator, so the edge and opportunity
//! maths are resolved at compile time and can be swapped for a stub in
//! tests.

use crate::records::{EdgeSnapshot, OpportunityDecision};
use crate::resilience::EntryGate;
use crate::state::{SnapshotReader, TradableMarketState};

/// Output of one market evaluation: always exactly one of each record
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub edge: EdgeSnapshot,
    pub decision: OpportunityDecision,
}

pub trait Evaluator {
    /// Called once per tick before any market is evaluated
    ///
    /// Per-product work (volatility estimates) belongs here so it is done
    /// once, not once per market.
    fn begin_tick(&self, _reader: &SnapshotReader, _now: i64) {}

    /// Evaluate one market snapshot under the current entry gate
    fn evaluate(&self, state: &TradableMarketState, gate: EntryGate, now: i64) -> Evaluation;

    /// Name for logging
    fn name(&self) -> &'static str;
}
