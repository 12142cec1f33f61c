//! Annualized volatility from spot history
//!
//! The estimate is a RiskMetrics-style EWMA of log returns over a resampled
//! price series:
//!
//! ```text
//! var_0 = r_0²
//! var_i = λ·var_{i-1} + (1 − λ)·r_i²
//! σ     = sqrt(var) · sqrt(SECONDS_PER_YEAR / step_s)
//! ```
//!
//! An estimate that cannot be trusted is rejected with a [`SigmaRejection`]
//! and [`SigmaMemory`] decides what to use instead.

use crate::probability::SECONDS_PER_YEAR;
use dashmap::DashMap;
use kestrel_core::config::VolatilityConfig;
use kestrel_core::records::SigmaSource;
use kestrel_core::state::SpotPoint;
use std::fmt;

const MIN_STEP_S: f64 = 1.0;
const MAX_STEP_S: f64 = 3_600.0;

/// Why an EWMA estimate was not used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigmaRejection {
    InsufficientPoints,
    InsufficientHistorySpan,
    MissingStep,
    BadStepSeconds,
    NonfiniteSigma,
    NonpositiveSigma,
    OutOfBounds,
}

impl SigmaRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigmaRejection::InsufficientPoints => "insufficient_points",
            SigmaRejection::InsufficientHistorySpan => "insufficient_history_span",
            SigmaRejection::MissingStep => "missing_step",
            SigmaRejection::BadStepSeconds => "bad_step_seconds",
            SigmaRejection::NonfiniteSigma => "nonfinite_sigma",
            SigmaRejection::NonpositiveSigma => "nonpositive_sigma",
            SigmaRejection::OutOfBounds => "out_of_bounds",
        }
    }
}

impl fmt::Display for SigmaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming EWMA of squared returns
#[derive(Debug, Clone, Copy)]
pub struct EwmaVariance {
    lambda: f64,
    variance: Option<f64>,
}

impl EwmaVariance {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            variance: None,
        }
    }

    #[inline]
    pub fn add_return(&mut self, r: f64) {
        let sq = r * r;
        self.variance = Some(match self.variance {
            None => sq,
            Some(var) => self.lambda * var + (1.0 - self.lambda) * sq,
        });
    }

    /// Volatility per sqrt(step)
    pub fn volatility(&self) -> Option<f64> {
        self.variance.map(f64::sqrt)
    }
}

/// Keep the last price in each `bucket_s` wide bucket
///
/// Input must be time-ordered, which the State Builder guarantees for
/// spot history.
pub fn resample_last(points: &[SpotPoint], bucket_s: i64) -> Vec<SpotPoint> {
    if bucket_s <= 1 {
        return points.to_vec();
    }
    let mut out: Vec<SpotPoint> = Vec::with_capacity(points.len());
    for point in points {
        let bucket = point.ts.div_euclid(bucket_s);
        match out.last_mut() {
            Some(last) if last.ts.div_euclid(bucket_s) == bucket => *last = *point,
            _ => out.push(*point),
        }
    }
    out
}

/// Log returns between consecutive positive prices
pub fn log_returns(prices: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut returns = Vec::new();
    let mut prev: Option<f64> = None;
    for price in prices.into_iter().filter(|p| p.is_finite() && *p > 0.0) {
        if let Some(prev) = prev {
            returns.push((price / prev).ln());
        }
        prev = Some(price);
    }
    returns
}

/// Median of the positive timestamp differences
pub fn median_step(points: &[SpotPoint]) -> Option<f64> {
    let mut diffs: Vec<i64> = points
        .windows(2)
        .map(|w| w[1].ts - w[0].ts)
        .filter(|d| *d > 0)
        .collect();
    if diffs.is_empty() {
        return None;
    }
    diffs.sort_unstable();
    let mid = diffs.len() / 2;
    let median = if diffs.len() % 2 == 0 {
        (diffs[mid - 1] + diffs[mid]) as f64 / 2.0
    } else {
        diffs[mid] as f64
    };
    Some(median)
}

#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    config: VolatilityConfig,
}

impl VolatilityEstimator {
    pub fn new(config: VolatilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VolatilityConfig {
        &self.config
    }

    /// First timestamp of the lookback window ending at `now`
    pub fn window_start(&self, now: i64) -> i64 {
        now - self.config.lookback_s
    }

    /// Annualized sigma from a time-ordered history already cut to the window
    pub fn estimate(&self, history: &[SpotPoint]) -> Result<f64, SigmaRejection> {
        let series = resample_last(history, self.config.resample_s);
        if series.len() < self.config.min_points.max(2) {
            return Err(SigmaRejection::InsufficientPoints);
        }

        let span = match (series.first(), series.last()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0,
        };
        if span < self.config.min_span_s {
            return Err(SigmaRejection::InsufficientHistorySpan);
        }

        let step = median_step(&series).ok_or(SigmaRejection::MissingStep)?;
        if !(MIN_STEP_S..=MAX_STEP_S).contains(&step) {
            return Err(SigmaRejection::BadStepSeconds);
        }

        let returns = log_returns(series.iter().map(|p| p.price));
        let mut ewma = EwmaVariance::new(self.config.ewma_lambda);
        for r in returns {
            ewma.add_return(r);
        }
        let per_step = ewma.volatility().ok_or(SigmaRejection::InsufficientPoints)?;
        let sigma = per_step * (SECONDS_PER_YEAR / step).sqrt();

        if !sigma.is_finite() {
            return Err(SigmaRejection::NonfiniteSigma);
        }
        if sigma <= 0.0 {
            return Err(SigmaRejection::NonpositiveSigma);
        }
        if sigma > self.config.sigma_max {
            return Err(SigmaRejection::OutOfBounds);
        }
        Ok(sigma)
    }
}

/// Sigma actually used for an evaluation, with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaChoice {
    pub sigma: f64,
    pub source: SigmaSource,
    /// Rejection that caused a fallback
    pub reason: Option<String>,
}

/// Last accepted sigma per product
///
/// Seeded at startup from the store so a restart does not fall straight to
/// the default while the history window refills.
#[derive(Debug)]
pub struct SigmaMemory {
    last_good: DashMap<String, f64>,
    default_sigma: f64,
    sigma_max: f64,
}

impl SigmaMemory {
    pub fn new(default_sigma: f64, sigma_max: f64) -> Self {
        Self {
            last_good: DashMap::new(),
            default_sigma,
            sigma_max,
        }
    }

    /// Remember a persisted sigma
    ///
    /// Returns false, keeping nothing, for a value the estimator itself would
    /// reject: non-finite, non-positive or above `sigma_max`.
    pub fn seed(&self, product_id: &str, sigma: f64) -> bool {
        let accepted = sigma.is_finite() && sigma > 0.0 && sigma <= self.sigma_max;
        if accepted {
            self.last_good.insert(product_id.to_string(), sigma);
        }
        accepted
    }

    pub fn last_good(&self, product_id: &str) -> Option<f64> {
        self.last_good.get(product_id).map(|v| *v)
    }

    pub fn resolve(
        &self,
        product_id: &str,
        estimate: Result<f64, SigmaRejection>,
    ) -> SigmaChoice {
        match estimate {
            Ok(sigma) => {
                self.last_good.insert(product_id.to_string(), sigma);
                SigmaChoice {
                    sigma,
                    source: SigmaSource::Ewma,
                    reason: None,
                }
            }
            Err(rejection) => match self.last_good(product_id) {
                Some(sigma) => SigmaChoice {
                    sigma,
                    source: SigmaSource::History,
                    reason: Some(rejection.to_string()),
                },
                None => SigmaChoice {
                    sigma: self.default_sigma,
                    source: SigmaSource::Default,
                    reason: Some(rejection.to_string()),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn zigzag(n: usize, step: i64, amplitude: f64) -> Vec<SpotPoint> {
        (0..n)
            .map(|i| SpotPoint {
                ts: 1_000 + i as i64 * step,
                price: if i % 2 == 0 {
                    100.0 * (1.0 + amplitude)
                } else {
                    100.0 * (1.0 - amplitude)
                },
            })
            .collect()
    }

    #[test]
    fn test_zigzag_sigma_matches_closed_form() {
        let estimator = VolatilityEstimator::new(VolatilityConfig::default());
        let sigma = estimator.estimate(&zigzag(200, 5, 0.0002)).unwrap();

        // every return has the same magnitude, so the EWMA variance is r²
        let r = (1.0002f64 / 0.9998).ln();
        assert_relative_eq!(sigma, r * (SECONDS_PER_YEAR / 5.0).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_rejections() {
        let estimator = VolatilityEstimator::new(VolatilityConfig::default());

        assert_eq!(
            estimator.estimate(&zigzag(10, 5, 0.0002)),
            Err(SigmaRejection::InsufficientPoints)
        );
        // 40 points one second apart collapse into 8 buckets
        assert_eq!(
            estimator.estimate(&zigzag(40, 1, 0.0002)),
            Err(SigmaRejection::InsufficientPoints)
        );
        // enough points but only 195 s of history
        let short = VolatilityConfig {
            resample_s: 1,
            ..VolatilityConfig::default()
        };
        assert_eq!(
            VolatilityEstimator::new(short).estimate(&zigzag(40, 5, 0.0002)),
            Err(SigmaRejection::InsufficientHistorySpan)
        );
        assert_eq!(
            estimator.estimate(&zigzag(200, 5, 0.005)),
            Err(SigmaRejection::OutOfBounds)
        );
        assert_eq!(
            estimator.estimate(&zigzag(200, 5, 0.0)),
            Err(SigmaRejection::NonpositiveSigma)
        );
    }

    #[test]
    fn test_step_outside_bounds_is_rejected() {
        let config = VolatilityConfig {
            min_points: 3,
            min_span_s: 0,
            ..VolatilityConfig::default()
        };
        let estimator = VolatilityEstimator::new(config);
        assert_eq!(
            estimator.estimate(&zigzag(5, 7_200, 0.0002)),
            Err(SigmaRejection::BadStepSeconds)
        );
    }

    #[test]
    fn test_resample_keeps_last_price_per_bucket() {
        let points = [
            SpotPoint { ts: 10, price: 1.0 },
            SpotPoint { ts: 12, price: 2.0 },
            SpotPoint { ts: 15, price: 3.0 },
            SpotPoint { ts: 19, price: 4.0 },
            SpotPoint { ts: 20, price: 5.0 },
        ];
        let prices: Vec<f64> = resample_last(&points, 5).iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_log_returns_skip_nonpositive_prices() {
        let returns = log_returns([100.0, 0.0, -5.0, 110.0]);
        assert_eq!(returns.len(), 1);
        assert_relative_eq!(returns[0], (1.1f64).ln());
    }

    #[test]
    fn test_median_step() {
        let points = [
            SpotPoint { ts: 0, price: 1.0 },
            SpotPoint { ts: 5, price: 1.0 },
            SpotPoint { ts: 5, price: 1.0 },
            SpotPoint { ts: 15, price: 1.0 },
        ];
        assert_eq!(median_step(&points), Some(7.5));
        assert_eq!(median_step(&points[..1]), None);
    }

    #[test]
    fn test_memory_fallback_order() {
        let memory = SigmaMemory::new(0.8, 5.0);

        let first = memory.resolve("BTC-USD", Err(SigmaRejection::InsufficientPoints));
        assert_eq!(first.source, SigmaSource::Default);
        assert_eq!(first.sigma, 0.8);
        assert_eq!(first.reason.as_deref(), Some("insufficient_points"));

        let good = memory.resolve("BTC-USD", Ok(0.55));
        assert_eq!(good.source, SigmaSource::Ewma);
        assert_eq!(good.reason, None);

        let later = memory.resolve("BTC-USD", Err(SigmaRejection::OutOfBounds));
        assert_eq!(later.source, SigmaSource::History);
        assert_eq!(later.sigma, 0.55);
        assert_eq!(later.reason.as_deref(), Some("out_of_bounds"));

        // memory is per product
        let other = memory.resolve("ETH-USD", Err(SigmaRejection::OutOfBounds));
        assert_eq!(other.source, SigmaSource::Default);
    }

    #[test]
    fn test_seed_ignores_garbage() {
        let memory = SigmaMemory::new(0.8, 5.0);
        assert!(!memory.seed("BTC-USD", f64::NAN));
        assert!(!memory.seed("ETH-USD", -1.0));
        assert!(memory.seed("SOL-USD", 0.9));
        assert_eq!(memory.last_good("BTC-USD"), None);
        assert_eq!(memory.last_good("ETH-USD"), None);
        assert_eq!(memory.last_good("SOL-USD"), Some(0.9));
    }

    #[test]
    fn test_seed_respects_sigma_ceiling() {
        // persisted under an older, higher ceiling
        let memory = SigmaMemory::new(0.8, 2.0);
        assert!(!memory.seed("BTC-USD", 3.5));
        assert!(memory.seed("ETH-USD", 2.0));

        let choice = memory.resolve("BTC-USD", Err(SigmaRejection::InsufficientPoints));
        assert_eq!(choice.source, SigmaSource::Default);
        assert_eq!(choice.sigma, 0.8);
        assert_eq!(memory.last_good("ETH-USD"), Some(2.0));
    }
}
