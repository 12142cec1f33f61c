//! Zero-drift lognormal probability model
//!
//! ```text
//! ln(S_T / S_0) ~ Normal(-0.5·σ²·τ, σ²·τ)        τ in years (365-day)
//!
//! P[S_T <= K] = Φ(z),   z = (ln(K/S_0) + 0.5·σ²·τ) / (σ·√τ)
//! ```
//!
//! Every function returns `None` ("unavailable") for non-positive spot,
//! sigma, horizon or strike. Callers must not substitute a number.

use kestrel_core::events::ContractShape;

pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

#[inline]
pub fn year_fraction(horizon_s: f64) -> f64 {
    horizon_s / SECONDS_PER_YEAR
}

/// Standard normal CDF
#[inline]
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

fn valid(spot: f64, sigma: f64, tau: f64) -> bool {
    spot.is_finite()
        && sigma.is_finite()
        && tau.is_finite()
        && spot > 0.0
        && sigma > 0.0
        && tau > 0.0
}

/// Standardized distance of `strike` for `P[S_T <= strike]`
pub fn z_score(spot: f64, strike: f64, sigma: f64, tau: f64) -> Option<f64> {
    if !valid(spot, sigma, tau) || !(strike.is_finite() && strike > 0.0) {
        return None;
    }
    let sigma_t = sigma * tau.sqrt();
    Some(((strike / spot).ln() + 0.5 * sigma_t * sigma_t) / sigma_t)
}

/// `P[S_T <= strike]`
pub fn prob_less_equal(spot: f64, strike: f64, sigma: f64, tau: f64) -> Option<f64> {
    z_score(spot, strike, sigma, tau).map(|z| norm_cdf(z).clamp(0.0, 1.0))
}

/// `P[S_T >= strike]`
pub fn prob_greater_equal(spot: f64, strike: f64, sigma: f64, tau: f64) -> Option<f64> {
    prob_less_equal(spot, strike, sigma, tau).map(|p| (1.0 - p).clamp(0.0, 1.0))
}

/// `P[lower <= S_T < upper]`
pub fn prob_between(spot: f64, lower: f64, upper: f64, sigma: f64, tau: f64) -> Option<f64> {
    let upper_p = prob_less_equal(spot, upper, sigma, tau)?;
    let lower_p = prob_less_equal(spot, lower, sigma, tau)?;
    Some((upper_p - lower_p).clamp(0.0, 1.0))
}

/// YES probability for a contract shape
pub fn prob_yes(shape: ContractShape, spot: f64, sigma: f64, tau: f64) -> Option<f64> {
    match shape {
        ContractShape::Less { upper } => prob_less_equal(spot, upper, sigma, tau),
        ContractShape::Greater { lower } => prob_greater_equal(spot, lower, sigma, tau),
        ContractShape::Between { lower, upper } => prob_between(spot, lower, upper, sigma, tau),
    }
}
