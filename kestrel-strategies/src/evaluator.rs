//! [`Evaluator`] implementation combining the Edge and Opportunity engines

use crate::edge::EdgeEngine;
use crate::opportunity::OpportunityEngine;
use crate::volatility::{SigmaChoice, SigmaMemory, SigmaRejection, VolatilityEstimator};
use dashmap::DashMap;
use kestrel_core::config::{EdgeConfig, OpportunityConfig};
use kestrel_core::engine::{Evaluation, Evaluator};
use kestrel_core::monitoring::StrategyMetrics;
use kestrel_core::records::SigmaSource;
use kestrel_core::resilience::EntryGate;
use kestrel_core::state::{SnapshotReader, TradableMarketState};
use tracing::warn;

pub struct EdgeEvaluator {
    edge: EdgeEngine,
    opportunity: OpportunityEngine,
    estimator: VolatilityEstimator,
    memory: SigmaMemory,
    /// Sigma chosen for each product at the start of the current tick
    sigmas: DashMap<String, SigmaChoice>,
    metrics: Option<StrategyMetrics>,
}

impl EdgeEvaluator {
    pub fn new(edge: EdgeConfig, opportunity: OpportunityConfig) -> Self {
        let estimator = VolatilityEstimator::new(edge.volatility.clone());
        let memory = SigmaMemory::new(edge.volatility.sigma_default, edge.volatility.sigma_max);
        let opportunity = OpportunityEngine::new(opportunity, edge.strategy_version.clone());
        Self {
            edge: EdgeEngine::new(edge),
            opportunity,
            estimator,
            memory,
            sigmas: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StrategyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed the fallback memory, typically from the last persisted snapshots
    ///
    /// Returns false when the value is outside what the estimator accepts.
    pub fn seed_sigma(&self, product_id: &str, sigma: f64) -> bool {
        self.memory.seed(product_id, sigma)
    }

    pub fn opportunity(&self) -> &OpportunityEngine {
        &self.opportunity
    }

    /// Sigma in force for a product this tick
    pub fn sigma_for(&self, product_id: &str) -> Option<SigmaChoice> {
        self.sigmas.get(product_id).map(|c| c.clone())
    }

    fn choose_sigma(&self, product_id: &str, estimate: Result<f64, SigmaRejection>) -> SigmaChoice {
        let choice = self.memory.resolve(product_id, estimate);
        if choice.source != SigmaSource::Ewma {
            warn!(
                product_id = %product_id,
                source = choice.source.as_str(),
                reason = choice.reason.as_deref().unwrap_or(""),
                sigma = choice.sigma,
                "sigma fallback"
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .sigma_fallbacks_total
                    .with_label_values(&[choice.source.as_str()])
                    .inc();
            }
        }
        choice
    }
}

impl Evaluator for EdgeEvaluator {
    fn begin_tick(&self, reader: &SnapshotReader, now: i64) {
        for product_id in reader.products() {
            let history = reader.spot_history(&product_id, self.estimator.window_start(now));
            let estimate = self.estimator.estimate(&history);
            let choice = self.choose_sigma(&product_id, estimate);
            self.sigmas.insert(product_id, choice);
        }
    }

    fn evaluate(&self, state: &TradableMarketState, gate: EntryGate, now: i64) -> Evaluation {
        let sigma = match self.sigma_for(&state.product_id) {
            Some(choice) => choice,
            None => {
                // no spot history at all for this product
                let choice =
                    self.choose_sigma(&state.product_id, Err(SigmaRejection::InsufficientPoints));
                self.sigmas.insert(state.product_id.clone(), choice.clone());
                choice
            }
        };

        let edge = self.edge.compute(state, Some(&sigma), now);
        let decision = self.opportunity.decide(&edge, gate, now);
        Evaluation { edge, decision }
    }

    fn name(&self) -> &'static str {
        "edge-evaluator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::config::IngestConfig;
    use kestrel_core::monitoring::MetricsRegistry;
    use kestrel_core::records::DecisionState;
    use kestrel_core::state::StateBuilder;
    use kestrel_core::testing::{contract_envelope, quote_envelope, spot_tick_envelope, validated};

    const NOW: i64 = 1_700_000_000;

    fn builder_with_market(spot_points: usize) -> StateBuilder {
        let mut builder = StateBuilder::new(IngestConfig::default());
        for i in 0..spot_points {
            let ts = NOW - (spot_points - i) as i64 * 5;
            let price = if i % 2 == 0 { 60_012.0 } else { 59_988.0 };
            builder.apply_event(&validated(spot_tick_envelope("BTC-USD", ts, price, Some(i as u64))));
        }
        builder.apply_event(&validated(spot_tick_envelope("BTC-USD", NOW, 60_000.0, Some(99_999))));
        builder.apply_event(&validated(contract_envelope(
            "KXBTC-T61000",
            NOW - 600,
            "less",
            None,
            Some(61_000.0),
            Some(NOW + 1_800),
        )));
        builder.apply_event(&validated(quote_envelope("KXBTC-T61000", NOW - 1, Some(90), Some(5), Some("m1"))));
        builder
    }

    #[test]
    fn test_ewma_sigma_when_history_is_rich() {
        let builder = builder_with_market(400);
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), OpportunityConfig::default());
        let reader = builder.reader();

        evaluator.begin_tick(&reader, NOW);
        let choice = evaluator.sigma_for("BTC-USD").unwrap();
        assert_eq!(choice.source, SigmaSource::Ewma);

        let state = reader.get_snapshot("KXBTC-T61000", NOW).unwrap();
        let Evaluation { edge, decision } = evaluator.evaluate(&state, EntryGate::Open, NOW);
        assert_eq!(edge.sigma_source, Some(SigmaSource::Ewma));
        assert!(edge.prob_yes.is_some());
        assert_eq!(decision.market_id, "KXBTC-T61000");
        assert_eq!(decision.ts_eval, NOW);
    }

    #[test]
    fn test_fallback_is_recorded_and_counted() {
        let builder = builder_with_market(3);
        let registry = MetricsRegistry::new().unwrap();
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), OpportunityConfig::default())
            .with_metrics(registry.strategy().clone());
        evaluator.seed_sigma("BTC-USD", 0.65);

        let reader = builder.reader();
        evaluator.begin_tick(&reader, NOW);
        let state = reader.get_snapshot("KXBTC-T61000", NOW).unwrap();
        let Evaluation { edge, .. } = evaluator.evaluate(&state, EntryGate::Open, NOW);

        assert_eq!(edge.sigma, Some(0.65));
        assert_eq!(edge.sigma_source, Some(SigmaSource::History));
        assert_eq!(edge.sigma_reason.as_deref(), Some("insufficient_points"));
        assert_eq!(
            registry
                .strategy()
                .sigma_fallbacks_total
                .with_label_values(&["history"])
                .get(),
            1
        );
    }

    #[test]
    fn test_evaluate_without_begin_tick_uses_default() {
        let builder = builder_with_market(0);
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), OpportunityConfig::default());
        let state = builder.reader().get_snapshot("KXBTC-T61000", NOW).unwrap();

        let Evaluation { edge, decision } = evaluator.evaluate(&state, EntryGate::Closed, NOW);
        assert_eq!(edge.sigma, Some(0.80));
        assert_eq!(edge.sigma_source, Some(SigmaSource::Default));
        assert_eq!(decision.state, DecisionState::Ineligible);
        assert_eq!(decision.reason, "no_trade_mode");
    }

    #[test]
    fn test_zero_cent_ask_never_trades() {
        let mut builder = builder_with_market(400);
        builder.apply_event(&validated(quote_envelope("KXBTC-T61000", NOW, Some(0), Some(100), Some("m2"))));
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), OpportunityConfig::default());
        let reader = builder.reader();
        evaluator.begin_tick(&reader, NOW);

        let state = reader.get_snapshot("KXBTC-T61000", NOW).unwrap();
        let Evaluation { edge, decision } = evaluator.evaluate(&state, EntryGate::Open, NOW);
        assert_eq!(edge.yes_ask, Some(0.0));
        assert_eq!(decision.state, DecisionState::Ineligible);
        assert_eq!(decision.reason, "ask_out_of_range");
    }
}
