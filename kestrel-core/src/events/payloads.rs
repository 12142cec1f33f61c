//! Market event payloads
//!
//! Each payload has a strict wire form (unknown fields rejected) and a typed
//! domain form. Conversion happens once, at validation time, and is where
//! quote prices move from integer cents to probability units.

use crate::data::quote::cents_to_probability;
use crate::data::ValidationError;
use serde::{Deserialize, Serialize};

/// Underlying spot price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotTick {
    pub ts: i64,
    pub product_id: String,
    pub price: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub sequence_num: Option<u64>,
}

/// Top-of-book bids for both sides of a binary market, in probability units
///
/// Asks are never taken from the wire; see [`crate::data::TwoSidedQuote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteUpdate {
    pub ts: i64,
    pub market_id: String,
    pub source_msg_id: Option<String>,
    pub yes_bid: Option<f64>,
    pub no_bid: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Unopened,
    Open,
    Closed,
    Settled,
    Other(String),
}

impl MarketStatus {
    /// Normalize an exchange status string (`active` is an alias of `open`)
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "active" => MarketStatus::Open,
            "unopened" | "initialized" => MarketStatus::Unopened,
            "closed" => MarketStatus::Closed,
            "settled" | "finalized" | "determined" => MarketStatus::Settled,
            other => MarketStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MarketStatus::Unopened => "unopened",
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
            MarketStatus::Other(s) => s,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, MarketStatus::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLifecycle {
    pub market_id: String,
    pub status: MarketStatus,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settlement_ts: Option<i64>,
}

/// Payoff shape of a binary contract on the underlying
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strike_type", rename_all = "snake_case")]
pub enum ContractShape {
    /// YES pays if S_T <= upper
    Less { upper: f64 },
    /// YES pays if S_T >= lower
    Greater { lower: f64 },
    /// YES pays if lower <= S_T < upper
    Between { lower: f64, upper: f64 },
}

impl ContractShape {
    pub fn kind(&self) -> &'static str {
        match self {
            ContractShape::Less { .. } => "less",
            ContractShape::Greater { .. } => "greater",
            ContractShape::Between { .. } => "between",
        }
    }

    pub fn lower(&self) -> Option<f64> {
        match self {
            ContractShape::Greater { lower } | ContractShape::Between { lower, .. } => Some(*lower),
            ContractShape::Less { .. } => None,
        }
    }

    pub fn upper(&self) -> Option<f64> {
        match self {
            ContractShape::Less { upper } | ContractShape::Between { upper, .. } => Some(*upper),
            ContractShape::Greater { .. } => None,
        }
    }

    /// Build a shape from exchange fields
    ///
    /// Returns `Ok(None)` when a required bound is absent: bounds are never
    /// inferred.
    pub fn from_parts(
        strike_type: &str,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Result<Option<Self>, ValidationError> {
        for (field, bound) in [("lower", lower), ("upper", upper)] {
            if let Some(value) = bound {
                if !value.is_finite() || value <= 0.0 {
                    return Err(ValidationError::invalid(
                        field,
                        format!("strike must be finite and positive, got {value}"),
                    ));
                }
            }
        }

        let shape = match strike_type.trim().to_ascii_lowercase().as_str() {
            "less" | "below" => upper.map(|upper| ContractShape::Less { upper }),
            "greater" | "above" => lower.map(|lower| ContractShape::Greater { lower }),
            "between" => match (lower, upper) {
                (Some(lower), Some(upper)) if lower >= upper => {
                    return Err(ValidationError::invalid(
                        "lower",
                        format!("lower {lower} must be below upper {upper}"),
                    ));
                }
                (Some(lower), Some(upper)) => Some(ContractShape::Between { lower, upper }),
                _ => None,
            },
            other => {
                return Err(ValidationError::invalid(
                    "strike_type",
                    format!("unknown strike type '{other}'"),
                ));
            }
        };

        Ok(shape)
    }
}

/// Contract terms keyed by ticker (the ticker is the market id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractUpdate {
    pub ticker: String,
    pub shape: Option<ContractShape>,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settled_ts: Option<i64>,
    pub outcome: Option<String>,
}

// ============================================================================
// Wire forms
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SpotTickWire {
    ts: i64,
    product_id: String,
    price: f64,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    bid_qty: Option<f64>,
    ask_qty: Option<f64>,
    sequence_num: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct QuoteUpdateWire {
    ts: i64,
    market_id: String,
    source_msg_id: Option<String>,
    yes_bid: Option<u32>,
    no_bid: Option<u32>,
    yes_ask: Option<u32>,
    no_ask: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MarketLifecycleWire {
    market_id: String,
    status: String,
    close_ts: Option<i64>,
    expected_expiration_ts: Option<i64>,
    expiration_ts: Option<i64>,
    settlement_ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ContractUpdateWire {
    ticker: String,
    strike_type: Option<String>,
    lower: Option<f64>,
    upper: Option<f64>,
    close_ts: Option<i64>,
    expected_expiration_ts: Option<i64>,
    expiration_ts: Option<i64>,
    settled_ts: Option<i64>,
    outcome: Option<String>,
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_positive_ts(field: &str, ts: i64) -> Result<(), ValidationError> {
    if ts <= 0 {
        return Err(ValidationError::invalid(field, format!("timestamp must be positive, got {ts}")));
    }
    Ok(())
}

impl TryFrom<SpotTickWire> for SpotTick {
    type Error = ValidationError;

    fn try_from(wire: SpotTickWire) -> Result<Self, Self::Error> {
        require_positive_ts("ts", wire.ts)?;
        require_non_empty("product_id", &wire.product_id)?;
        if !wire.price.is_finite() || wire.price <= 0.0 {
            return Err(ValidationError::invalid(
                "price",
                format!("must be finite and positive, got {}", wire.price),
            ));
        }
        for (field, value) in [
            ("best_bid", wire.best_bid),
            ("best_ask", wire.best_ask),
            ("bid_qty", wire.bid_qty),
            ("ask_qty", wire.ask_qty),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ValidationError::invalid(field, format!("must be finite and non-negative, got {v}")));
                }
            }
        }

        Ok(SpotTick {
            ts: wire.ts,
            product_id: wire.product_id,
            price: wire.price,
            best_bid: wire.best_bid,
            best_ask: wire.best_ask,
            sequence_num: wire.sequence_num,
        })
    }
}

impl TryFrom<QuoteUpdateWire> for QuoteUpdate {
    type Error = ValidationError;

    fn try_from(wire: QuoteUpdateWire) -> Result<Self, Self::Error> {
        require_positive_ts("ts", wire.ts)?;
        require_non_empty("market_id", &wire.market_id)?;
        for (field, value) in [
            ("yes_bid", wire.yes_bid),
            ("no_bid", wire.no_bid),
            ("yes_ask", wire.yes_ask),
            ("no_ask", wire.no_ask),
        ] {
            if let Some(cents) = value {
                if cents > 100 {
                    return Err(ValidationError::invalid(field, format!("price {cents} outside 0..=100 cents")));
                }
            }
        }
        if let (Some(yes_bid), Some(no_bid)) = (wire.yes_bid, wire.no_bid) {
            if yes_bid + no_bid > 100 {
                return Err(ValidationError::CrossedQuote { yes_bid, no_bid });
            }
        }

        Ok(QuoteUpdate {
            ts: wire.ts,
            market_id: wire.market_id,
            source_msg_id: wire.source_msg_id,
            yes_bid: wire.yes_bid.map(cents_to_probability),
            no_bid: wire.no_bid.map(cents_to_probability),
        })
    }
}

impl TryFrom<MarketLifecycleWire> for MarketLifecycle {
    type Error = ValidationError;

    fn try_from(wire: MarketLifecycleWire) -> Result<Self, Self::Error> {
        require_non_empty("market_id", &wire.market_id)?;
        require_non_empty("status", &wire.status)?;

        Ok(MarketLifecycle {
            market_id: wire.market_id,
            status: MarketStatus::parse(&wire.status),
            close_ts: wire.close_ts,
            expected_expiration_ts: wire.expected_expiration_ts,
            expiration_ts: wire.expiration_ts,
            settlement_ts: wire.settlement_ts,
        })
    }
}

impl TryFrom<ContractUpdateWire> for ContractUpdate {
    type Error = ValidationError;

    fn try_from(wire: ContractUpdateWire) -> Result<Self, Self::Error> {
        require_non_empty("ticker", &wire.ticker)?;
        let shape = match wire.strike_type.as_deref() {
            Some(strike_type) => ContractShape::from_parts(strike_type, wire.lower, wire.upper)?,
            None => None,
        };

        Ok(ContractUpdate {
            ticker: wire.ticker,
            shape,
            close_ts: wire.close_ts,
            expected_expiration_ts: wire.expected_expiration_ts,
            expiration_ts: wire.expiration_ts,
            settled_ts: wire.settled_ts,
            outcome: wire.outcome,
        })
    }
}
