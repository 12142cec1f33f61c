//! Consumer-lag breach and recovery, driven through the full pipeline
//!
//! Timeline (seconds from T0), one spot and one quote per second. Lag is
//! measured against the newest `ts_produced` seen, so the lagging producer
//! is lagging from the start:
//!
//! ```text
//!   0..90    lag 31 (> 30)    HEALTHY until the breach has lasted 60s
//!        60                   -> NO_TRADE
//!  90..      lag 0            -> RECOVERING (shadow)
//!       390                   -> HEALTHY after the 300s hold
//! ```

use kestrel_core::config::KestrelConfig;
use kestrel_core::engine::Pipeline;
use kestrel_core::persistence::PersistItem;
use kestrel_core::resilience::{EntryGate, Mode};
use kestrel_core::state::StateBuilder;
use kestrel_core::testing::{quote_envelope, spot_tick_envelope};
use kestrel_strategies::EdgeEvaluator;
use serde_json::{json, Value};

const T0: i64 = 1_700_000_000;
const MARKET: &str = "KXBTC-T61000";

fn config() -> KestrelConfig {
    let mut config = KestrelConfig::default();
    config.degraded.start_in_no_trade = false;
    config
}

fn produced_at(mut raw: Value, ts_produced: i64) -> Value {
    raw["ts_produced"] = json!(ts_produced);
    raw
}

#[test]
fn test_consumer_lag_breach_and_recovery() {
    let config = config();
    let evaluator = EdgeEvaluator::new(config.edge.clone(), config.opportunity.clone());
    let mut pipeline = Pipeline::new(
        &config,
        StateBuilder::new(config.ingest.clone()),
        evaluator,
        Vec::<PersistItem>::new(),
    );

    let mut offset = 0u64;
    let mut modes = Vec::new();
    let mut transitions = Vec::new();

    for t in 0..=400 {
        let now = T0 + t;
        let lag = if t < 90 { 31 } else { 0 };

        let spot = spot_tick_envelope("BTC-USD", now, 60_000.0, Some(t as u64));
        let quote = quote_envelope(MARKET, now, Some(40), Some(55), Some(&format!("q{t}")));
        for raw in [spot, quote] {
            pipeline.ingest(produced_at(raw, now - lag), offset, now).unwrap();
            offset += 1;
        }

        let report = pipeline.tick(now).unwrap();
        modes.push((t, report.mode));
        if let Some(transition) = report.transition {
            transitions.push((t, transition.from, transition.to));
        }
    }

    let mode_at = |t: i64| modes[t as usize].1;
    assert_eq!(mode_at(0), Mode::Healthy);
    assert_eq!(mode_at(59), Mode::Healthy);
    assert_eq!(mode_at(60), Mode::NoTrade);
    assert_eq!(mode_at(89), Mode::NoTrade);
    assert_eq!(mode_at(90), Mode::Recovering);
    assert_eq!(mode_at(389), Mode::Recovering);
    assert_eq!(mode_at(390), Mode::Healthy);

    assert_eq!(
        transitions,
        vec![
            (60, Mode::Healthy, Mode::NoTrade),
            (90, Mode::NoTrade, Mode::Recovering),
            (390, Mode::Recovering, Mode::Healthy),
        ]
    );
}

#[test]
fn test_gate_follows_mode() {
    let config = config();
    let evaluator = EdgeEvaluator::new(config.edge.clone(), config.opportunity.clone());
    let mut pipeline = Pipeline::new(
        &config,
        StateBuilder::new(config.ingest.clone()),
        evaluator,
        Vec::<PersistItem>::new(),
    );

    // a quote that goes silent breaches quote_age after 30s and fires 30s later
    let quote = quote_envelope(MARKET, T0, Some(40), Some(55), Some("q0"));
    pipeline.ingest(quote, 0, T0).unwrap();

    let mut gates = Vec::new();
    for t in 0..=70 {
        let now = T0 + t;
        let spot = spot_tick_envelope("BTC-USD", now, 60_000.0, Some(t as u64));
        pipeline.ingest(spot, 1 + t as u64, now).unwrap();
        gates.push(pipeline.tick(now).unwrap().gate);
    }

    assert_eq!(gates[30], EntryGate::Open);
    assert_eq!(gates[60], EntryGate::Open);
    assert_eq!(gates[61], EntryGate::Closed);
    assert_eq!(pipeline.controller().mode(), Mode::NoTrade);
    assert!(pipeline
        .controller()
        .active_triggers()
        .contains(&"quote_age".to_string()));
}
