//! Edge Engine
//!
//! A pure function from one [`TradableMarketState`] (plus the sigma chosen
//! for its product) to exactly one [`EdgeSnapshot`]. Nothing is inferred:
//! a missing bound, horizon, spot or quote becomes an explicit skip reason
//! and the affected outputs stay `None`.
//!
//! Skip reasons are recorded in precedence order, so
//! `snapshot.skip_reasons.primary()` is the most fundamental problem:
//!
//! ```text
//! missing_contract → missing_settlement_ts → expired_contract → stale_spot
//!   → missing_quote → stale_quote → missing_yes_ask / missing_no_ask
//! ```

use crate::fees::fee_per_contract;
use crate::probability::{prob_yes, year_fraction};
use crate::volatility::SigmaChoice;
use kestrel_core::config::EdgeConfig;
use kestrel_core::records::{EdgeSnapshot, SkipReason, SkipReasons};
use kestrel_core::state::TradableMarketState;

#[derive(Debug, Clone)]
pub struct EdgeEngine {
    config: EdgeConfig,
}

impl EdgeEngine {
    pub fn new(config: EdgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn compute(
        &self,
        state: &TradableMarketState,
        sigma: Option<&SigmaChoice>,
        now: i64,
    ) -> EdgeSnapshot {
        let mut reasons = SkipReasons::new();

        let shape = state.shape();
        if shape.is_none() {
            reasons.push(SkipReason::MissingContract);
        }

        let settlement_ts = state.settlement_ts();
        if settlement_ts.is_none() {
            reasons.push(SkipReason::MissingSettlementTs);
        }
        let horizon_s = settlement_ts.map(|settle| settle - now);
        // a settlement inside the grace window is still τ <= 0
        if horizon_s.is_some_and(|horizon| horizon <= 0) {
            reasons.push(SkipReason::ExpiredContract);
        }

        let spot = state
            .spot
            .filter(|s| s.age_s <= self.config.max_spot_age_s);
        if spot.is_none() {
            reasons.push(SkipReason::StaleSpot);
        }

        let quote = state.quote.map(|q| q.quote);
        match state.quote {
            None => reasons.push(SkipReason::MissingQuote),
            Some(view) if view.age_s > self.config.max_quote_age_s => {
                reasons.push(SkipReason::StaleQuote)
            }
            Some(_) => {}
        }
        let yes_ask = quote.and_then(|q| q.yes_ask());
        let no_ask = quote.and_then(|q| q.no_ask());
        if quote.is_some() {
            if yes_ask.is_none() {
                reasons.push(SkipReason::MissingYesAsk);
            }
            if no_ask.is_none() {
                reasons.push(SkipReason::MissingNoAsk);
            }
        }

        let market_usable = !reasons.iter().any(|r| r.is_market_level());
        let prob = match (market_usable, shape, spot, sigma, horizon_s) {
            (true, Some(shape), Some(spot), Some(sigma), Some(horizon)) => {
                prob_yes(shape, spot.price, sigma.sigma, year_fraction(horizon as f64))
            }
            _ => None,
        };

        let quote_usable = !reasons.contains(SkipReason::MissingQuote)
            && !reasons.contains(SkipReason::StaleQuote);
        let contracts = self.config.contracts;
        let (ev_take_yes, ev_take_no) = match prob {
            Some(p) if quote_usable => (
                yes_ask.and_then(|ask| Some(p - (ask + fee_per_contract(ask, contracts)?))),
                no_ask.and_then(|ask| Some((1.0 - p) - (ask + fee_per_contract(ask, contracts)?))),
            ),
            _ => (None, None),
        };

        EdgeSnapshot {
            asof_ts: now,
            market_id: state.market_id.clone(),
            product_id: state.product_id.clone(),
            strategy_version: self.config.strategy_version.clone(),
            settlement_ts,
            horizon_s,
            spot: state.spot.map(|s| s.price),
            spot_ts: state.spot.map(|s| s.ts),
            sigma: sigma.map(|s| s.sigma),
            sigma_source: sigma.map(|s| s.source),
            sigma_reason: sigma.and_then(|s| s.reason.clone()),
            prob_yes: prob,
            yes_bid: quote.and_then(|q| q.yes_bid),
            yes_ask,
            no_bid: quote.and_then(|q| q.no_bid),
            no_ask,
            quote_ts: state.quote.map(|q| q.ts),
            p_market: quote.and_then(|q| q.yes_mid()),
            ev_take_yes,
            ev_take_no,
            skip_reasons: reasons,
        }
    }
}
