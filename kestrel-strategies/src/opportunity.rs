//! Opportunity Engine
//!
//! Gates an [`EdgeSnapshot`] through freshness, spread, horizon and the
//! degraded-mode entry gate, then picks the side with the larger EV:
//!
//! ```text
//! INELIGIBLE ──(all filters pass)──▶ ELIGIBLE ──(ev >= min_ev)──▶ WOULD_TRADE
//!                                             └─(ev <  min_ev)──▶ PASS
//! ```
//!
//! Every call returns exactly one [`OpportunityDecision`] with a reason.

use dashmap::DashMap;
use kestrel_core::config::OpportunityConfig;
use kestrel_core::records::{DecisionState, EdgeSnapshot, OpportunityDecision, Side};
use kestrel_core::resilience::EntryGate;
use std::fmt;
use tracing::debug;

/// Why a market is not eligible for a new entry (beyond edge skip reasons)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IneligibleReason {
    MissingProbability,
    HorizonTooLong,
    SpreadTooWide,
    QuoteStale,
    AskOutOfRange,
    EntryWindowClosed,
    NoTradeMode,
}

impl IneligibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IneligibleReason::MissingProbability => "missing_probability",
            IneligibleReason::HorizonTooLong => "horizon_too_long",
            IneligibleReason::SpreadTooWide => "spread_too_wide",
            IneligibleReason::QuoteStale => "quote_stale",
            IneligibleReason::AskOutOfRange => "ask_out_of_range",
            IneligibleReason::EntryWindowClosed => "entry_window_closed",
            IneligibleReason::NoTradeMode => "no_trade_mode",
        }
    }
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const REASON_WOULD_TRADE: &str = "would_trade";
pub const REASON_EV_BELOW_MIN: &str = "ev_below_min";

// float noise on cent prices must not flip a spread check
const SPREAD_EPSILON: f64 = 1e-9;

pub struct OpportunityEngine {
    config: OpportunityConfig,
    strategy_version: String,
    states: DashMap<String, DecisionState>,
}

impl OpportunityEngine {
    pub fn new(config: OpportunityConfig, strategy_version: impl Into<String>) -> Self {
        Self {
            config,
            strategy_version: strategy_version.into(),
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OpportunityConfig {
        &self.config
    }

    /// Last decided state of a market
    pub fn state(&self, market_id: &str) -> Option<DecisionState> {
        self.states.get(market_id).map(|s| *s)
    }

    pub fn decide(&self, edge: &EdgeSnapshot, gate: EntryGate, now: i64) -> OpportunityDecision {
        // the entry guard serializes evaluation of one market
        let mut entry = self
            .states
            .entry(edge.market_id.clone())
            .or_insert(DecisionState::Ineligible);
        let previous = *entry;

        let decision = match self.eligibility(edge, gate, now) {
            Err(reason) => self.record(
                edge,
                now,
                gate,
                Side::None,
                DecisionState::Ineligible,
                reason,
                None,
            ),
            Ok((side, ev)) => {
                let (state, reason) = if ev >= self.config.min_ev {
                    (DecisionState::WouldTrade, REASON_WOULD_TRADE)
                } else {
                    (DecisionState::Pass, REASON_EV_BELOW_MIN)
                };
                self.record(edge, now, gate, side, state, reason.to_string(), Some(ev))
            }
        };

        if previous != decision.state {
            debug!(
                market_id = %edge.market_id,
                from = %previous,
                to = %decision.state,
                reason = %decision.reason,
                "opportunity state changed"
            );
        }
        *entry = decision.state;
        decision
    }

    /// Best side and its EV, or the first reason the market is ineligible
    fn eligibility(
        &self,
        edge: &EdgeSnapshot,
        gate: EntryGate,
        now: i64,
    ) -> Result<(Side, f64), String> {
        if edge.prob_yes.is_none() || best_side(edge.ev_take_yes, edge.ev_take_no).is_none() {
            return Err(edge
                .skip_reasons
                .primary()
                .map(|r| r.as_str())
                .unwrap_or(IneligibleReason::MissingProbability.as_str())
                .to_string());
        }

        let fail = |reason: IneligibleReason| -> Result<(Side, f64), String> {
            Err(reason.to_string())
        };

        let ev_yes = edge.ev_take_yes.filter(|_| self.ask_tradable(edge.yes_ask));
        let ev_no = edge.ev_take_no.filter(|_| self.ask_tradable(edge.no_ask));
        let Some(best) = best_side(ev_yes, ev_no) else {
            return fail(IneligibleReason::AskOutOfRange);
        };

        match edge.horizon_s {
            Some(horizon) if horizon <= self.config.max_horizon_s => {}
            _ => return fail(IneligibleReason::HorizonTooLong),
        }

        let spread = match (edge.yes_ask, edge.yes_bid) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        };
        match spread {
            Some(spread) if spread <= self.config.max_spread + SPREAD_EPSILON => {}
            _ => return fail(IneligibleReason::SpreadTooWide),
        }

        match edge.quote_ts {
            Some(ts) if ((now - ts).max(0) as f64) <= self.config.quote_freshness_s => {}
            _ => return fail(IneligibleReason::QuoteStale),
        }

        if let Some(horizon) = edge.horizon_s {
            if horizon <= self.config.no_new_entries_last_s {
                return fail(IneligibleReason::EntryWindowClosed);
            }
        }

        if !gate.allows_entries() {
            return fail(IneligibleReason::NoTradeMode);
        }

        Ok(best)
    }

    fn ask_tradable(&self, ask: Option<f64>) -> bool {
        ask.is_some_and(|a| {
            a >= self.config.min_ask - SPREAD_EPSILON && a <= self.config.max_ask + SPREAD_EPSILON
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        edge: &EdgeSnapshot,
        now: i64,
        gate: EntryGate,
        side: Side,
        state: DecisionState,
        reason: String,
        ev_net: Option<f64>,
    ) -> OpportunityDecision {
        OpportunityDecision {
            ts_eval: now,
            market_id: edge.market_id.clone(),
            strategy_version: self.strategy_version.clone(),
            side,
            eligible: state != DecisionState::Ineligible,
            state,
            reason,
            ev_net,
            shadow: gate.is_shadow(),
        }
    }
}

/// Side with the larger EV; YES wins a tie
fn best_side(ev_yes: Option<f64>, ev_no: Option<f64>) -> Option<(Side, f64)> {
    match (ev_yes, ev_no) {
        (Some(yes), Some(no)) if no > yes => Some((Side::No, no)),
        (Some(yes), _) => Some((Side::Yes, yes)),
        (None, Some(no)) => Some((Side::No, no)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::records::{SkipReason, SkipReasons};

    const NOW: i64 = 1_700_000_000;

    fn edge(ev_yes: Option<f64>, ev_no: Option<f64>) -> EdgeSnapshot {
        EdgeSnapshot {
            asof_ts: NOW,
            market_id: "KXBTC-T61000".to_string(),
            product_id: "BTC-USD".to_string(),
            strategy_version: "edge-v1".to_string(),
            settlement_ts: Some(NOW + 1_800),
            horizon_s: Some(1_800),
            spot: Some(60_000.0),
            spot_ts: Some(NOW),
            sigma: Some(0.6),
            sigma_source: None,
            sigma_reason: None,
            prob_yes: Some(0.6),
            yes_bid: Some(0.50),
            yes_ask: Some(0.54),
            no_bid: Some(0.46),
            no_ask: Some(0.50),
            quote_ts: Some(NOW - 5),
            p_market: Some(0.52),
            ev_take_yes: ev_yes,
            ev_take_no: ev_no,
            skip_reasons: SkipReasons::new(),
        }
    }

    fn engine() -> OpportunityEngine {
        OpportunityEngine::new(OpportunityConfig::default(), "edge-v1")
    }

    #[test]
    fn test_would_trade_picks_best_side() {
        let engine = engine();
        let d = engine.decide(&edge(Some(0.04), Some(-0.12)), EntryGate::Open, NOW);
        assert_eq!(d.state, DecisionState::WouldTrade);
        assert_eq!(d.side, Side::Yes);
        assert_eq!(d.reason, "would_trade");
        assert_eq!(d.ev_net, Some(0.04));
        assert!(d.eligible);
        assert!(!d.shadow);

        let d = engine.decide(&edge(Some(-0.2), Some(0.05)), EntryGate::Open, NOW);
        assert_eq!(d.side, Side::No);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let d = engine().decide(&edge(Some(0.03), None), EntryGate::Open, NOW);
        assert_eq!(d.state, DecisionState::WouldTrade);

        let d = engine().decide(&edge(Some(0.029), Some(0.01)), EntryGate::Open, NOW);
        assert_eq!(d.state, DecisionState::Pass);
        assert_eq!(d.reason, "ev_below_min");
        assert_eq!(d.side, Side::Yes);
        assert!(d.eligible);
    }

    #[test]
    fn test_skip_reason_makes_market_ineligible() {
        let mut e = edge(None, None);
        e.prob_yes = None;
        e.skip_reasons.push(SkipReason::StaleSpot);
        let d = engine().decide(&e, EntryGate::Open, NOW);
        assert_eq!(d.state, DecisionState::Ineligible);
        assert_eq!(d.side, Side::None);
        assert_eq!(d.reason, "stale_spot");
        assert_eq!(d.ev_net, None);
        assert!(!d.eligible);
    }

    #[test]
    fn test_missing_probability_without_skip_reason() {
        let mut e = edge(Some(0.1), Some(0.1));
        e.prob_yes = None;
        let d = engine().decide(&e, EntryGate::Open, NOW);
        assert_eq!(d.reason, "missing_probability");
    }

    #[test]
    fn test_policy_filters() {
        let engine = engine();

        let mut long = edge(Some(0.1), None);
        long.horizon_s = Some(3_601);
        assert_eq!(engine.decide(&long, EntryGate::Open, NOW).reason, "horizon_too_long");

        let mut wide = edge(Some(0.1), None);
        wide.yes_bid = Some(0.40);
        assert_eq!(engine.decide(&wide, EntryGate::Open, NOW).reason, "spread_too_wide");

        let mut edge_spread = edge(Some(0.1), None);
        edge_spread.yes_bid = Some(0.48);
        assert_eq!(engine.decide(&edge_spread, EntryGate::Open, NOW).reason, "would_trade");

        let mut stale = edge(Some(0.1), None);
        stale.quote_ts = Some(NOW - 31);
        assert_eq!(engine.decide(&stale, EntryGate::Open, NOW).reason, "quote_stale");

        let mut late = edge(Some(0.1), None);
        late.horizon_s = Some(120);
        assert_eq!(engine.decide(&late, EntryGate::Open, NOW).reason, "entry_window_closed");
    }

    #[test]
    fn test_ask_band_excludes_untradable_side() {
        let engine = engine();

        // yes_bid 0, no_bid 100: YES ask is 0c and carries the whole probability as EV
        let mut free = edge(Some(0.9969), Some(-0.9969));
        free.prob_yes = Some(0.9969);
        free.yes_bid = Some(0.0);
        free.yes_ask = Some(0.0);
        free.no_bid = Some(1.0);
        free.no_ask = Some(1.0);
        let d = engine.decide(&free, EntryGate::Open, NOW);
        assert_eq!(d.state, DecisionState::Ineligible);
        assert_eq!(d.reason, "ask_out_of_range");
        assert_eq!(d.side, Side::None);

        // an out-of-band YES leaves NO as the only candidate
        let mut one_sided = edge(Some(0.5), Some(0.04));
        one_sided.yes_bid = Some(0.97);
        one_sided.yes_ask = Some(0.995);
        let d = engine.decide(&one_sided, EntryGate::Open, NOW);
        assert_eq!(d.side, Side::No);
        assert_eq!(d.ev_net, Some(0.04));
        assert_eq!(d.state, DecisionState::WouldTrade);

        // band edges are tradable
        let mut edge_ask = edge(Some(0.1), None);
        edge_ask.yes_bid = Some(0.95);
        edge_ask.yes_ask = Some(0.99);
        assert_eq!(engine.decide(&edge_ask, EntryGate::Open, NOW).reason, "would_trade");
    }

    #[test]
    fn test_entry_gate() {
        let engine = engine();
        let closed = engine.decide(&edge(Some(0.1), None), EntryGate::Closed, NOW);
        assert_eq!(closed.state, DecisionState::Ineligible);
        assert_eq!(closed.reason, "no_trade_mode");
        assert!(!closed.shadow);

        let shadow = engine.decide(&edge(Some(0.1), None), EntryGate::Shadow, NOW);
        assert_eq!(shadow.state, DecisionState::WouldTrade);
        assert!(shadow.shadow);
    }

    #[test]
    fn test_state_is_tracked_per_market() {
        let engine = engine();
        assert_eq!(engine.state("KXBTC-T61000"), None);

        engine.decide(&edge(Some(0.1), None), EntryGate::Open, NOW);
        assert_eq!(engine.state("KXBTC-T61000"), Some(DecisionState::WouldTrade));

        engine.decide(&edge(Some(0.1), None), EntryGate::Closed, NOW + 1);
        assert_eq!(engine.state("KXBTC-T61000"), Some(DecisionState::Ineligible));
    }

    #[test]
    fn test_best_side_tie_prefers_yes() {
        assert_eq!(best_side(Some(0.1), Some(0.1)), Some((Side::Yes, 0.1)));
        assert_eq!(best_side(None, None), None);
    }
}
