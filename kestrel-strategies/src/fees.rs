//! Exchange taker fee schedule
//!
//! ```text
//! fee = ceil(0.07 · C · P · (1 − P) · 100) / 100        (dollars)
//! ```
//!
//! `P` is the contract price in `[0, 1]`. The ceiling is computed in exact
//! decimal so a product like `0.07 · 0.5 · 0.5 = 0.0175` never lands on the
//! wrong side of a cent through binary float error.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;

const FEE_RATE: Decimal = dec!(0.07);
const CENTS: Decimal = dec!(100);

/// Total taker fee in dollars for `contracts` at `price`
///
/// `None` when the price is outside `[0, 1]`, not finite, or no contracts
/// are traded.
pub fn taker_fee(price: f64, contracts: u32) -> Option<Decimal> {
    if contracts == 0 || !price.is_finite() || !(0.0..=1.0).contains(&price) {
        return None;
    }
    // prices arrive as whole cents; round away float noise from derived asks
    let p = Decimal::from_f64(price)?.round_dp(4);
    if p.is_zero() || p == Decimal::ONE {
        return Some(Decimal::ZERO);
    }

    let raw = FEE_RATE * Decimal::from(contracts) * p * (Decimal::ONE - p);
    Some((raw * CENTS).ceil() / CENTS)
}

/// Fee charged per contract when buying `contracts` at `price`
pub fn fee_per_contract(price: f64, contracts: u32) -> Option<f64> {
    let total = taker_fee(price, contracts)?;
    (total / Decimal::from(contracts)).to_f64()
}
