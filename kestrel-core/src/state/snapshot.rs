//! Read-only views of the projection
//!
//! [`SnapshotReader`] is the only way other components see State Builder
//! data. A snapshot clones the market's `Arc` under a short read lock, so a
//! reader never observes a half-applied update.

use super::projection::{HorizonChain, MarketProjection, Projection, SpotPoint};
use crate::data::TwoSidedQuote;
use crate::events::{ContractShape, MarketStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Seconds elapsed since `ts`, never negative
#[inline]
pub fn age_seconds(now: i64, ts: i64) -> f64 {
    (now - ts).max(0) as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotView {
    pub price: f64,
    pub ts: i64,
    pub age_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuoteView {
    pub quote: TwoSidedQuote,
    pub ts: i64,
    pub age_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContractView {
    pub shape: Option<ContractShape>,
    pub ts: i64,
    pub age_s: f64,
}

/// Immutable per-market snapshot with per-field freshness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradableMarketState {
    pub market_id: String,
    pub product_id: String,
    /// Clock the ages are measured against
    pub asof_ts: i64,
    pub projection_ts: Option<i64>,
    pub spot: Option<SpotView>,
    pub quote: Option<QuoteView>,
    pub contract: Option<ContractView>,
    pub status: Option<MarketStatus>,
    pub horizon: HorizonChain,
}

impl TradableMarketState {
    fn build(market: &MarketProjection, spot: Option<SpotView>, now: i64) -> Self {
        Self {
            market_id: market.market_id.clone(),
            product_id: market.product_id.clone(),
            asof_ts: now,
            projection_ts: market.projection_ts(),
            spot,
            quote: market.quote.as_ref().map(|q| QuoteView {
                quote: q.quote,
                ts: q.stamp.ts,
                age_s: age_seconds(now, q.stamp.ts),
            }),
            contract: market.contract.as_ref().map(|c| ContractView {
                shape: c.shape,
                ts: c.stamp.ts,
                age_s: age_seconds(now, c.stamp.ts),
            }),
            status: market.lifecycle.as_ref().map(|l| l.status.clone()),
            horizon: market.horizon(),
        }
    }

    pub fn settlement_ts(&self) -> Option<i64> {
        self.horizon.resolve()
    }

    pub fn shape(&self) -> Option<ContractShape> {
        self.contract.and_then(|c| c.shape)
    }
}

/// Which markets count toward quote coverage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoveragePolicy {
    pub quote_freshness_s: f64,
    pub max_horizon_s: i64,
    pub expiry_grace_s: i64,
}

/// Cloneable read handle on the State Builder's projection
#[derive(Clone)]
pub struct SnapshotReader {
    shared: Arc<RwLock<Projection>>,
}

impl SnapshotReader {
    pub(crate) fn new(shared: Arc<RwLock<Projection>>) -> Self {
        Self { shared }
    }

    pub fn get_snapshot(&self, market_id: &str, now: i64) -> Option<TradableMarketState> {
        let (market, spot) = {
            let projection = self.shared.read();
            let market = Arc::clone(projection.markets.get(market_id)?);
            let spot = projection.spots.get(&market.product_id).map(|s| SpotView {
                price: s.price,
                ts: s.stamp.ts,
                age_s: age_seconds(now, s.stamp.ts),
            });
            (market, spot)
        };
        Some(TradableMarketState::build(&market, spot, now))
    }

    pub fn market_ids(&self) -> Vec<String> {
        self.shared.read().markets.keys().cloned().collect()
    }

    /// Products with a spot price or a market referencing them
    pub fn products(&self) -> Vec<String> {
        let projection = self.shared.read();
        let mut products: Vec<String> = projection
            .spots
            .keys()
            .cloned()
            .chain(projection.markets.values().map(|m| m.product_id.clone()))
            .collect();
        products.sort();
        products.dedup();
        products
    }

    /// Applied spot points at or after `since_ts`, oldest first
    pub fn spot_history(&self, product_id: &str, since_ts: i64) -> Vec<SpotPoint> {
        self.shared
            .read()
            .spot_history
            .get(product_id)
            .map(|history| history.iter().filter(|p| p.ts >= since_ts).copied().collect())
            .unwrap_or_default()
    }

    pub fn projection_ts(&self, market_id: &str) -> Option<i64> {
        self.shared.read().markets.get(market_id)?.projection_ts()
    }

    pub fn latest_spot_ts(&self) -> Option<i64> {
        self.shared.read().spots.values().map(|s| s.stamp.ts).max()
    }

    pub fn latest_quote_ts(&self) -> Option<i64> {
        self.shared
            .read()
            .markets
            .values()
            .filter_map(|m| m.quote.as_ref().map(|q| q.stamp.ts))
            .max()
    }

    /// Fraction of tradable markets whose quote is fresh
    ///
    /// `None` when nothing is currently tradable.
    pub fn quote_coverage(&self, now: i64, policy: &CoveragePolicy) -> Option<f64> {
        let projection = self.shared.read();
        let mut tradable = 0usize;
        let mut covered = 0usize;

        for market in projection.markets.values() {
            let open = market
                .lifecycle
                .as_ref()
                .map(|l| l.status.is_open())
                .unwrap_or(true);
            let has_bounds = market.contract.as_ref().and_then(|c| c.shape).is_some();
            let in_horizon = market
                .horizon()
                .resolve()
                .map(|settle| settle > now - policy.expiry_grace_s && settle - now <= policy.max_horizon_s)
                .unwrap_or(false);

            if !(open && has_bounds && in_horizon) {
                continue;
            }
            tradable += 1;

            let fresh = market
                .quote
                .as_ref()
                .map(|q| age_seconds(now, q.stamp.ts) <= policy.quote_freshness_s)
                .unwrap_or(false);
            if fresh {
                covered += 1;
            }
        }

        if tradable == 0 {
            None
        } else {
            Some(covered as f64 / tradable as f64)
        }
    }
}
