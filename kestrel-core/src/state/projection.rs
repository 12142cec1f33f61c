//! In-memory projection owned by the State Builder

use super::stamp::FieldStamp;
use crate::data::TwoSidedQuote;
use crate::events::{ContractShape, MarketStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotPoint {
    pub ts: i64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotState {
    pub price: f64,
    pub sequence_num: Option<u64>,
    pub stamp: FieldStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteState {
    pub quote: TwoSidedQuote,
    pub stamp: FieldStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub status: MarketStatus,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settlement_ts: Option<i64>,
    pub stamp: FieldStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractState {
    pub shape: Option<ContractShape>,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settled_ts: Option<i64>,
    pub outcome: Option<String>,
    pub stamp: FieldStamp,
}

/// Settlement timestamp candidates, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HorizonChain {
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub settlement_ts: Option<i64>,
}

impl HorizonChain {
    /// close → expected expiration → legacy settlement; never guessed
    pub fn resolve(&self) -> Option<i64> {
        self.close_ts
            .or(self.expected_expiration_ts)
            .or(self.settlement_ts)
    }
}

/// Everything known about one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketProjection {
    pub market_id: String,
    pub product_id: String,
    pub quote: Option<QuoteState>,
    pub lifecycle: Option<LifecycleState>,
    pub contract: Option<ContractState>,
}

impl MarketProjection {
    pub fn new(market_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            product_id: product_id.into(),
            quote: None,
            lifecycle: None,
            contract: None,
        }
    }

    /// Latest applied domain timestamp across all field groups
    pub fn projection_ts(&self) -> Option<i64> {
        [
            self.quote.as_ref().map(|q| q.stamp.ts),
            self.lifecycle.as_ref().map(|l| l.stamp.ts),
            self.contract.as_ref().map(|c| c.stamp.ts),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Lifecycle fields win over contract fields for each link of the chain
    pub fn horizon(&self) -> HorizonChain {
        let lifecycle = self.lifecycle.as_ref();
        let contract = self.contract.as_ref();

        HorizonChain {
            close_ts: lifecycle
                .and_then(|l| l.close_ts)
                .or_else(|| contract.and_then(|c| c.close_ts)),
            expected_expiration_ts: lifecycle
                .and_then(|l| l.expected_expiration_ts)
                .or_else(|| contract.and_then(|c| c.expected_expiration_ts)),
            settlement_ts: lifecycle
                .and_then(|l| l.settlement_ts.or(l.expiration_ts))
                .or_else(|| contract.and_then(|c| c.settled_ts.or(c.expiration_ts))),
        }
    }
}

/// The full projection: markets, spot per product, spot history per product
///
/// Markets sit behind `Arc` so published snapshots share them copy-on-write.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub markets: BTreeMap<String, Arc<MarketProjection>>,
    pub spots: BTreeMap<String, SpotState>,
    pub spot_history: BTreeMap<String, VecDeque<SpotPoint>>,
}
