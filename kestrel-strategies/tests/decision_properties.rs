//! The entry decision over arbitrary edges
//!
//! A market is WOULD_TRADE exactly when every filter passes and the better
//! side clears `min_ev`; otherwise it is PASS or INELIGIBLE with a reason.

use kestrel_core::config::OpportunityConfig;
use kestrel_core::records::{DecisionState, EdgeSnapshot, Side, SkipReasons};
use kestrel_core::resilience::EntryGate;
use kestrel_strategies::OpportunityEngine;
use proptest::prelude::*;

const NOW: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
struct Case {
    ev_yes: Option<f64>,
    ev_no: Option<f64>,
    spread_cents: u32,
    quote_age_s: i64,
    horizon_s: i64,
    gate: EntryGate,
}

fn gate() -> impl Strategy<Value = EntryGate> {
    prop_oneof![
        Just(EntryGate::Open),
        Just(EntryGate::Shadow),
        Just(EntryGate::Closed),
    ]
}

fn case() -> impl Strategy<Value = Case> {
    (
        proptest::option::weighted(0.9, -0.5f64..0.5),
        proptest::option::weighted(0.9, -0.5f64..0.5),
        0u32..12,
        0i64..60,
        1i64..7_200,
        gate(),
    )
        .prop_map(|(ev_yes, ev_no, spread_cents, quote_age_s, horizon_s, gate)| Case {
            ev_yes,
            ev_no,
            spread_cents,
            quote_age_s,
            horizon_s,
            gate,
        })
}

fn edge(case: &Case) -> EdgeSnapshot {
    let yes_bid = 0.40;
    let yes_ask = yes_bid + case.spread_cents as f64 / 100.0;
    EdgeSnapshot {
        asof_ts: NOW,
        market_id: "KXBTC-T61000".to_string(),
        product_id: "BTC-USD".to_string(),
        strategy_version: "edge-v1".to_string(),
        settlement_ts: Some(NOW + case.horizon_s),
        horizon_s: Some(case.horizon_s),
        spot: Some(60_000.0),
        spot_ts: Some(NOW),
        sigma: Some(0.6),
        sigma_source: None,
        sigma_reason: None,
        prob_yes: Some(0.5),
        yes_bid: Some(yes_bid),
        yes_ask: Some(yes_ask),
        no_bid: Some(1.0 - yes_ask),
        no_ask: Some(1.0 - yes_bid),
        quote_ts: Some(NOW - case.quote_age_s),
        p_market: Some((yes_bid + yes_ask) / 2.0),
        ev_take_yes: case.ev_yes,
        ev_take_no: case.ev_no,
        skip_reasons: SkipReasons::new(),
    }
}

fn filters_pass(case: &Case, config: &OpportunityConfig) -> bool {
    case.horizon_s <= config.max_horizon_s
        && case.horizon_s > config.no_new_entries_last_s
        && case.spread_cents <= 6
        && case.quote_age_s as f64 <= config.quote_freshness_s
        && case.gate != EntryGate::Closed
}

proptest! {
    #[test]
    fn prop_would_trade_iff_filters_pass_and_ev_clears(case in case()) {
        let config = OpportunityConfig::default();
        let engine = OpportunityEngine::new(config.clone(), "edge-v1");
        let decision = engine.decide(&edge(&case), case.gate, NOW);

        let best = match (case.ev_yes, case.ev_no) {
            (Some(y), Some(n)) => Some(y.max(n)),
            (y, n) => y.or(n),
        };
        let expect_trade = best.is_some()
            && filters_pass(&case, &config)
            && best.is_some_and(|ev| ev >= config.min_ev);

        prop_assert_eq!(decision.would_trade(), expect_trade, "{:?} -> {:?}", case, decision);
        prop_assert_eq!(decision.shadow, case.gate == EntryGate::Shadow);
        prop_assert!(!decision.reason.is_empty());

        match decision.state {
            DecisionState::Ineligible => {
                prop_assert_eq!(decision.side, Side::None);
                prop_assert!(decision.ev_net.is_none());
                prop_assert!(!decision.eligible);
            }
            DecisionState::WouldTrade | DecisionState::Pass => {
                prop_assert!(decision.eligible);
                prop_assert_ne!(decision.side, Side::None);
                prop_assert_eq!(decision.ev_net, best);
            }
            DecisionState::Eligible => prop_assert!(false, "transient state leaked"),
        }
    }

    #[test]
    fn prop_closed_gate_never_trades(case in case()) {
        let engine = OpportunityEngine::new(OpportunityConfig::default(), "edge-v1");
        let decision = engine.decide(&edge(&case), EntryGate::Closed, NOW);
        prop_assert!(!decision.would_trade());
    }
}

#[test]
fn test_state_is_tracked_per_market() {
    let engine = OpportunityEngine::new(OpportunityConfig::default(), "edge-v1");
    let case = Case {
        ev_yes: Some(0.08),
        ev_no: Some(-0.1),
        spread_cents: 4,
        quote_age_s: 2,
        horizon_s: 1_800,
        gate: EntryGate::Open,
    };

    engine.decide(&edge(&case), EntryGate::Open, NOW);
    assert_eq!(engine.state("KXBTC-T61000"), Some(DecisionState::WouldTrade));

    engine.decide(&edge(&case), EntryGate::Closed, NOW + 5);
    assert_eq!(engine.state("KXBTC-T61000"), Some(DecisionState::Ineligible));
    assert_eq!(engine.state("KXBTC-T62000"), None);
}
