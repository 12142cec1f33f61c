//! Two-sided binary market quotes
//!
//! The exchange publishes bids only. Asks are derived here, once, and every
//! consumer reads them from [`TwoSidedQuote`]:
//!
//! ```text
//! yes_ask = 1 - no_bid
//! no_ask  = 1 - yes_bid
//! ```
//!
//! All prices are probability units in `[0, 1]`.

use serde::{Deserialize, Serialize};

pub fn cents_to_probability(cents: u32) -> f64 {
    cents as f64 / 100.0
}

pub fn probability_to_cents(probability: f64) -> u32 {
    (probability * 100.0).round().clamp(0.0, 100.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TwoSidedQuote {
    pub yes_bid: Option<f64>,
    pub no_bid: Option<f64>,
}

impl TwoSidedQuote {
    pub fn new(yes_bid: Option<f64>, no_bid: Option<f64>) -> Self {
        Self { yes_bid, no_bid }
    }

    #[inline]
    pub fn yes_ask(&self) -> Option<f64> {
        self.no_bid.map(|no_bid| 1.0 - no_bid)
    }

    #[inline]
    pub fn no_ask(&self) -> Option<f64> {
        self.yes_bid.map(|yes_bid| 1.0 - yes_bid)
    }

    /// Bid/ask spread, identical on both sides for derived asks
    pub fn spread(&self) -> Option<f64> {
        Some(self.yes_ask()? - self.yes_bid?)
    }

    /// Market-implied YES probability
    pub fn yes_mid(&self) -> Option<f64> {
        Some((self.yes_bid? + self.yes_ask()?) / 2.0)
    }

    pub fn is_two_sided(&self) -> bool {
        self.yes_bid.is_some() && self.no_bid.is_some()
    }
}
