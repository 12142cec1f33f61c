//! Append-only strategy records
//!
//! [`EdgeSnapshot`] and [`OpportunityDecision`] are produced once per market
//! per evaluation and never mutated. Both carry a unique key that the store
//! enforces.

use crate::events::{derive_key, EventType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of reasons an edge computation could not produce a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingContract,
    MissingSettlementTs,
    ExpiredContract,
    MissingQuote,
    MissingYesAsk,
    MissingNoAsk,
    StaleSpot,
    StaleQuote,
}

impl SkipReason {
    pub const ALL: [SkipReason; 8] = [
        SkipReason::MissingContract,
        SkipReason::MissingSettlementTs,
        SkipReason::ExpiredContract,
        SkipReason::MissingQuote,
        SkipReason::MissingYesAsk,
        SkipReason::MissingNoAsk,
        SkipReason::StaleSpot,
        SkipReason::StaleQuote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingContract => "missing_contract",
            SkipReason::MissingSettlementTs => "missing_settlement_ts",
            SkipReason::ExpiredContract => "expired_contract",
            SkipReason::MissingQuote => "missing_quote",
            SkipReason::MissingYesAsk => "missing_yes_ask",
            SkipReason::MissingNoAsk => "missing_no_ask",
            SkipReason::StaleSpot => "stale_spot",
            SkipReason::StaleQuote => "stale_quote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value)
    }

    /// Whether the reason makes the whole market unusable (no probability)
    pub fn is_market_level(&self) -> bool {
        matches!(
            self,
            SkipReason::MissingContract
                | SkipReason::MissingSettlementTs
                | SkipReason::ExpiredContract
                | SkipReason::StaleSpot
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, duplicate-free list of skip reasons
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkipReasons(Vec<SkipReason>);

impl SkipReasons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reason: SkipReason) {
        if !self.0.contains(&reason) {
            self.0.push(reason);
        }
    }

    pub fn contains(&self, reason: SkipReason) -> bool {
        self.0.contains(&reason)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first recorded reason
    pub fn primary(&self) -> Option<SkipReason> {
        self.0.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = SkipReason> + '_ {
        self.0.iter().copied()
    }

    /// Persisted form: comma-joined labels, `None` when empty
    pub fn to_column(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for SkipReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reason) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(reason.as_str())?;
        }
        Ok(())
    }
}

impl FromIterator<SkipReason> for SkipReasons {
    fn from_iter<I: IntoIterator<Item = SkipReason>>(iter: I) -> Self {
        let mut reasons = SkipReasons::new();
        for reason in iter {
            reasons.push(reason);
        }
        reasons
    }
}

/// Where the sigma used for an evaluation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigmaSource {
    /// Freshly estimated from spot history
    Ewma,
    /// Last accepted estimate (in memory or persisted)
    History,
    /// Configured conservative default
    Default,
}

impl SigmaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigmaSource::Ewma => "ewma",
            SigmaSource::History => "history",
            SigmaSource::Default => "default",
        }
    }
}

/// Output of the edge engine for one market at one evaluation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub asof_ts: i64,
    pub market_id: String,
    /// Underlying the probability was computed against
    pub product_id: String,
    pub strategy_version: String,
    /// Resolved settlement timestamp from the horizon chain
    pub settlement_ts: Option<i64>,
    /// Seconds from `asof_ts` to settlement
    pub horizon_s: Option<i64>,
    pub spot: Option<f64>,
    pub spot_ts: Option<i64>,
    pub sigma: Option<f64>,
    pub sigma_source: Option<SigmaSource>,
    pub sigma_reason: Option<String>,
    pub prob_yes: Option<f64>,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
    pub no_bid: Option<f64>,
    pub no_ask: Option<f64>,
    pub quote_ts: Option<i64>,
    /// Market-implied YES probability (yes mid)
    pub p_market: Option<f64>,
    pub ev_take_yes: Option<f64>,
    pub ev_take_no: Option<f64>,
    pub skip_reasons: SkipReasons,
}

impl EdgeSnapshot {
    pub fn key(&self) -> (i64, &str, &str) {
        (self.asof_ts, &self.market_id, &self.strategy_version)
    }

    pub fn idempotency_key(&self) -> String {
        let payload = serde_json::json!({
            "asof_ts": self.asof_ts,
            "market_id": self.market_id,
            "strategy_version": self.strategy_version,
        });
        // the three tuple fields are always present, so derivation cannot fail
        derive_key(EventType::EdgeSnapshot, 1, "kestrel", &payload)
            .unwrap_or_else(|_| format!("edge_snapshot:v1:{}:{}", self.asof_ts, self.market_id))
    }

    /// Probability usable (no market-level skip)
    pub fn has_probability(&self) -> bool {
        self.prob_yes.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
    None,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
            Side::None => "NONE",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-market opportunity state machine
///
/// ```text
/// INELIGIBLE ──▶ ELIGIBLE ──▶ WOULD_TRADE
///                         └─▶ PASS
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionState {
    Ineligible,
    Eligible,
    WouldTrade,
    Pass,
}

impl DecisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionState::Ineligible => "INELIGIBLE",
            DecisionState::Eligible => "ELIGIBLE",
            DecisionState::WouldTrade => "WOULD_TRADE",
            DecisionState::Pass => "PASS",
        }
    }
}

impl fmt::Display for DecisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trade/no-trade decision, always with a reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDecision {
    pub ts_eval: i64,
    pub market_id: String,
    pub strategy_version: String,
    pub side: Side,
    pub eligible: bool,
    pub state: DecisionState,
    pub reason: String,
    pub ev_net: Option<f64>,
    /// Produced under a shadow (paper) entry gate
    pub shadow: bool,
}

impl OpportunityDecision {
    pub fn key(&self) -> (i64, &str, Side, &str) {
        (self.ts_eval, &self.market_id, self.side, &self.strategy_version)
    }

    pub fn idempotency_key(&self) -> String {
        let payload = serde_json::json!({
            "ts_eval": self.ts_eval,
            "market_id": self.market_id,
            "side": self.side.as_str(),
            "strategy_version": self.strategy_version,
        });
        derive_key(EventType::OpportunityDecision, 1, "kestrel", &payload).unwrap_or_else(|_| {
            format!("opportunity_decision:v1:{}:{}", self.ts_eval, self.market_id)
        })
    }

    pub fn would_trade(&self) -> bool {
        self.state == DecisionState::WouldTrade
    }
}
