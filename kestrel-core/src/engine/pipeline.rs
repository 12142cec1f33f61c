//! Decision pipeline
//!
//! `Pipeline<E, S>` owns the State Builder and drives one evaluator over it.
//! Both type parameters are resolved at compile time.
//!
//! ## Ingest Path
//!
//! ```text
//!   raw envelope ──▶ validate ──ok──▶ StateBuilder::apply_at ──▶ sink (event)
//!                       │
//!                       └─err──▶ sink (dead-letter)
//! ```
//!
//! Every consumed envelope reaches the sink, valid or not, so the committed
//! offset can move past it.
//!
//! ## Tick Path
//!
//! ```text
//!   health sample ──▶ controller ──▶ gate
//!                                     │
//!   for each market: snapshot ──▶ Evaluator::evaluate(gate) ──▶ sink (edge, decision)
//! ```

use super::traits::{Evaluation, Evaluator};
use crate::config::KestrelConfig;
use crate::data::{DeadLetterRecord, EnvelopeValidator};
use crate::error::PipelineError;
use crate::monitoring::MetricsRegistry;
use crate::persistence::{PersistItem, PersistSink, StorageError};
use crate::resilience::{
    DegradedModeController, DependencyHealth, EntryGate, HealthLine, HealthReporter,
    HealthSample, Mode, ModeTransition,
};
use crate::state::{
    age_seconds, ApplyOutcome, CheckpointSchedule, CoveragePolicy, SnapshotReader, StateBuilder,
};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one consumed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Projected(ApplyOutcome),
    DeadLettered { reason: &'static str },
}

/// Summary of one evaluation tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub ts: i64,
    pub mode: Mode,
    pub gate: EntryGate,
    pub markets: usize,
    pub skipped: usize,
    pub would_trade: usize,
    pub transition: Option<ModeTransition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub envelopes: u64,
    pub dead_lettered: u64,
    pub applied: u64,
    pub discarded: u64,
    pub ticks: u64,
    pub edges: u64,
    pub decisions: u64,
    pub checkpoints: u64,
}

pub struct Pipeline<E: Evaluator, S: PersistSink> {
    validator: EnvelopeValidator,
    builder: StateBuilder,
    reader: SnapshotReader,
    evaluator: E,
    sink: S,
    controller: DegradedModeController,
    reporter: HealthReporter,
    coverage: CoveragePolicy,
    dependencies: DependencyHealth,
    metrics: Option<MetricsRegistry>,
    checkpoint_path: PathBuf,
    every_events: u64,
    every_secs: i64,
    schedule: Option<CheckpointSchedule>,
    last_produced_ts: Option<i64>,
    last_eval_ts: Option<i64>,
    stats: PipelineStats,
}

impl<E: Evaluator, S: PersistSink> Pipeline<E, S> {
    pub fn new(config: &KestrelConfig, builder: StateBuilder, evaluator: E, sink: S) -> Self {
        info!(evaluator = evaluator.name(), markets = builder.market_count(), "pipeline created");
        let reader = builder.reader();

        Self {
            validator: EnvelopeValidator::new(),
            builder,
            reader,
            evaluator,
            sink,
            controller: DegradedModeController::new(config.degraded.clone()),
            reporter: HealthReporter::new(config.degraded.health_interval_s),
            coverage: CoveragePolicy {
                quote_freshness_s: config.opportunity.quote_freshness_s,
                max_horizon_s: config.opportunity.max_horizon_s,
                expiry_grace_s: config.edge.expiry_grace_s,
            },
            dependencies: DependencyHealth::new(),
            metrics: None,
            checkpoint_path: config.checkpoint.path.clone(),
            every_events: config.checkpoint.every_events,
            every_secs: config.checkpoint.every_secs,
            schedule: None,
            last_produced_ts: None,
            last_eval_ts: None,
            stats: PipelineStats::default(),
        }
    }

    /// Wire metrics into the pipeline, its builder and its controller
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        let builder = std::mem::replace(&mut self.builder, StateBuilder::new(Default::default()));
        self.builder = builder.with_metrics(metrics.state().clone());
        self.reader = self.builder.reader();

        let controller = std::mem::replace(
            &mut self.controller,
            DegradedModeController::new(Default::default()),
        );
        self.controller = controller.with_metrics(metrics.health().clone());
        self.metrics = Some(metrics);
        self
    }

    /// Dependency flags copied into every health sample
    pub fn with_dependencies(mut self, dependencies: DependencyHealth) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_validator(mut self, validator: EnvelopeValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn builder(&self) -> &StateBuilder {
        &self.builder
    }

    pub fn reader(&self) -> &SnapshotReader {
        &self.reader
    }

    pub fn controller(&self) -> &DegradedModeController {
        &self.controller
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Consume one raw envelope read at stream `offset`
    pub fn ingest(&mut self, raw: Value, offset: u64, now: i64) -> Result<IngestOutcome, PipelineError> {
        self.stats.envelopes += 1;
        if let Some(metrics) = &self.metrics {
            metrics.ingest().envelopes_total.inc();
        }

        let event = match self.validator.validate(&raw) {
            Ok(event) => event,
            Err(e) => {
                let reason = e.reason();
                warn!(offset, reason, detail = %e, "envelope dead-lettered");
                let record = DeadLetterRecord::from_validation(raw, &e, now);
                self.submit(PersistItem::DeadLetter {
                    record,
                    offset: Some(offset),
                })?;
                self.stats.dead_lettered += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.ingest().dead_letters_total.with_label_values(&[reason]).inc();
                }
                return Ok(IngestOutcome::DeadLettered { reason });
            }
        };

        self.last_produced_ts = Some(
            self.last_produced_ts
                .map_or(event.ts_produced, |last| last.max(event.ts_produced)),
        );

        let outcome = self.builder.apply_at(&event, offset);
        if outcome.is_applied() {
            self.stats.applied += 1;
        } else {
            self.stats.discarded += 1;
        }
        self.schedule(now).record_event();

        // stale and duplicate events still go to the raw log; the store dedups
        self.submit(PersistItem::Event {
            event,
            offset: Some(offset),
        })?;

        Ok(IngestOutcome::Projected(outcome))
    }

    /// Run one evaluation pass over every known market
    pub fn tick(&mut self, now: i64) -> Result<TickReport, PipelineError> {
        let started = Instant::now();

        let sample = self.health_sample(now);
        let transition = self.controller.observe(&sample);
        let mode = self.controller.mode();
        if self.reporter.is_due(now) {
            let line = HealthLine::new(&sample, mode, self.controller.active_triggers());
            info!("{line}");
        }

        let gate = self.controller.gate();
        self.evaluator.begin_tick(&self.reader, now);

        let mut market_ids = self.reader.market_ids();
        market_ids.sort();

        let mut report = TickReport {
            ts: now,
            mode,
            gate,
            markets: 0,
            skipped: 0,
            would_trade: 0,
            transition,
        };

        for market_id in &market_ids {
            let Some(state) = self.reader.get_snapshot(market_id, now) else {
                continue;
            };
            let Evaluation { edge, decision } = self.evaluator.evaluate(&state, gate, now);

            report.markets += 1;
            if let Some(reason) = edge.skip_reasons.primary() {
                report.skipped += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.strategy().edge_skips_total.with_label_values(&[reason.as_str()]).inc();
                }
            }
            if decision.would_trade() {
                report.would_trade += 1;
            }
            if let Some(metrics) = &self.metrics {
                metrics
                    .strategy()
                    .decisions_total
                    .with_label_values(&[decision.reason.as_str()])
                    .inc();
            }
            debug!(
                market_id = %market_id,
                state = %decision.state,
                side = %decision.side,
                reason = %decision.reason,
                "market evaluated"
            );

            self.submit(PersistItem::Edge(edge))?;
            self.submit(PersistItem::Decision(decision))?;
            self.stats.edges += 1;
            self.stats.decisions += 1;
        }

        self.last_eval_ts = Some(now);
        self.stats.ticks += 1;
        if let Some(metrics) = &self.metrics {
            metrics
                .strategy()
                .tick_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        Ok(report)
    }

    /// Write a checkpoint when the cadence says so; returns whether one was written
    pub fn checkpoint_if_due(&mut self, now: i64) -> Result<bool, PipelineError> {
        if !self.schedule(now).is_due(now) {
            return Ok(false);
        }
        self.write_checkpoint(now)?;
        Ok(true)
    }

    pub fn write_checkpoint(&mut self, now: i64) -> Result<(), PipelineError> {
        let checkpoint = self.builder.checkpoint(now);
        checkpoint.save(&self.checkpoint_path)?;
        self.schedule(now).mark_written(now);
        self.stats.checkpoints += 1;
        info!(
            path = %self.checkpoint_path.display(),
            offset = ?checkpoint.last_offset,
            markets = self.builder.market_count(),
            "checkpoint written"
        );
        Ok(())
    }

    fn schedule(&mut self, now: i64) -> &mut CheckpointSchedule {
        let (every_events, every_secs) = (self.every_events, self.every_secs);
        self.schedule
            .get_or_insert_with(|| CheckpointSchedule::new(every_events, every_secs, now))
    }

    fn health_sample(&self, now: i64) -> HealthSample {
        HealthSample {
            now,
            spot_age_s: self.reader.latest_spot_ts().map(|ts| age_seconds(now, ts)),
            quote_age_s: self.reader.latest_quote_ts().map(|ts| age_seconds(now, ts)),
            snapshot_age_s: self.last_eval_ts.map(|ts| age_seconds(now, ts)),
            consumer_lag_s: self.last_produced_ts.map(|ts| age_seconds(now, ts)),
            quote_coverage: self.reader.quote_coverage(now, &self.coverage),
            dependencies: self.dependencies.snapshot(),
        }
    }

    fn submit(&mut self, item: PersistItem) -> Result<(), PipelineError> {
        self.sink.submit(item).map_err(|e| match e {
            StorageError::Closed => PipelineError::Fatal("persistence channel closed".into()),
            other => PipelineError::TransientStorage(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DecisionState, EdgeSnapshot, OpportunityDecision, Side, SkipReason, SkipReasons};
    use crate::resilience::STORAGE;
    use crate::state::TradableMarketState;
    use crate::testing::{contract_envelope, quote_envelope, spot_tick_envelope};
    use parking_lot::Mutex;

    /// Marks every market `missing_quote` and records the gate it saw
    #[derive(Default)]
    struct StubEvaluator {
        gates: Mutex<Vec<EntryGate>>,
        ticks: Mutex<u32>,
    }

    impl Evaluator for StubEvaluator {
        fn begin_tick(&self, _reader: &SnapshotReader, _now: i64) {
            *self.ticks.lock() += 1;
        }

        fn evaluate(&self, state: &TradableMarketState, gate: EntryGate, now: i64) -> Evaluation {
            self.gates.lock().push(gate);
            let mut skip_reasons = SkipReasons::new();
            if state.quote.is_none() {
                skip_reasons.push(SkipReason::MissingQuote);
            }
            Evaluation {
                edge: EdgeSnapshot {
                    asof_ts: now,
                    market_id: state.market_id.clone(),
                    product_id: state.product_id.clone(),
                    strategy_version: "stub".into(),
                    settlement_ts: state.settlement_ts(),
                    horizon_s: None,
                    spot: state.spot.map(|s| s.price),
                    spot_ts: state.spot.map(|s| s.ts),
                    sigma: None,
                    sigma_source: None,
                    sigma_reason: None,
                    prob_yes: None,
                    yes_bid: None,
                    yes_ask: None,
                    no_bid: None,
                    no_ask: None,
                    quote_ts: None,
                    p_market: None,
                    ev_take_yes: None,
                    ev_take_no: None,
                    skip_reasons,
                },
                decision: OpportunityDecision {
                    ts_eval: now,
                    market_id: state.market_id.clone(),
                    strategy_version: "stub".into(),
                    side: Side::None,
                    eligible: false,
                    state: DecisionState::Ineligible,
                    reason: "stub".into(),
                    ev_net: None,
                    shadow: gate.is_shadow(),
                },
            }
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn pipeline() -> Pipeline<StubEvaluator, Vec<PersistItem>> {
        let config = KestrelConfig::default();
        let builder = StateBuilder::new(config.ingest.clone());
        Pipeline::new(&config, builder, StubEvaluator::default(), Vec::new())
    }

    fn seed_market(pipeline: &mut Pipeline<StubEvaluator, Vec<PersistItem>>, ts: i64) {
        let envelopes = [
            spot_tick_envelope("BTC-USD", ts, 60_000.0, Some(1)),
            contract_envelope("KXBTC-1", ts, "greater", Some(60_000.0), None, Some(ts + 600)),
            quote_envelope("KXBTC-1", ts, Some(40), Some(55), Some("q1")),
        ];
        for (offset, raw) in envelopes.into_iter().enumerate() {
            pipeline.ingest(raw, offset as u64, ts).unwrap();
        }
    }

    #[test]
    fn test_every_envelope_reaches_the_sink() {
        let mut pipeline = pipeline();
        let good = spot_tick_envelope("BTC-USD", 100, 60_000.0, Some(1));
        let mut bad = spot_tick_envelope("BTC-USD", 101, 60_000.0, Some(2));
        bad["payload"]["price"] = serde_json::json!(-5.0);

        assert_eq!(
            pipeline.ingest(good.clone(), 0, 100).unwrap(),
            IngestOutcome::Projected(ApplyOutcome::Applied)
        );
        assert!(matches!(
            pipeline.ingest(bad, 1, 101).unwrap(),
            IngestOutcome::DeadLettered { .. }
        ));
        assert!(matches!(
            pipeline.ingest(good, 2, 102).unwrap(),
            IngestOutcome::Projected(ApplyOutcome::Duplicate)
        ));

        let offsets: Vec<_> = pipeline.sink().iter().map(|i| (i.kind(), i.offset())).collect();
        assert_eq!(
            offsets,
            vec![
                ("event", Some(0)),
                ("dead_letter", Some(1)),
                ("event", Some(2)),
            ]
        );
        let stats = pipeline.stats();
        assert_eq!((stats.applied, stats.discarded, stats.dead_lettered), (1, 1, 1));
        assert_eq!(pipeline.builder().last_offset(), Some(2));
    }

    #[test]
    fn test_tick_emits_one_edge_and_one_decision_per_market() {
        let mut pipeline = pipeline();
        seed_market(&mut pipeline, 1_000);
        pipeline
            .ingest(contract_envelope("KXBTC-2", 1_000, "less", None, Some(61_000.0), Some(1_600)), 3, 1_000)
            .unwrap();

        let before = pipeline.sink().len();
        let report = pipeline.tick(1_001).unwrap();
        assert_eq!(report.markets, 2);
        assert_eq!(report.skipped, 1); // KXBTC-2 has no quote

        let emitted: Vec<_> = pipeline.sink()[before..].iter().map(PersistItem::kind).collect();
        assert_eq!(
            emitted,
            vec!["edge_snapshot", "opportunity_decision", "edge_snapshot", "opportunity_decision"]
        );
        assert_eq!(*pipeline.evaluator().ticks.lock(), 1);
    }

    #[test]
    fn test_gate_closed_at_startup_then_shadow() {
        let mut pipeline = pipeline();
        seed_market(&mut pipeline, 1_000);

        // no evaluation yet, so snapshot age is unknown and startup stays
        let first = pipeline.tick(1_000).unwrap();
        assert_eq!(first.mode, Mode::NoTrade);
        assert_eq!(first.gate, EntryGate::Closed);

        let second = pipeline.tick(1_001).unwrap();
        assert_eq!(second.mode, Mode::Recovering);
        assert_eq!(second.gate, EntryGate::Shadow);
        assert_eq!(
            pipeline.evaluator().gates.lock().as_slice(),
            &[EntryGate::Closed, EntryGate::Shadow]
        );
    }

    #[test]
    fn test_storage_outage_is_a_trigger() {
        let dependencies = DependencyHealth::new();
        dependencies.register(STORAGE);
        let mut pipeline = pipeline().with_dependencies(dependencies.clone());
        seed_market(&mut pipeline, 1_000);
        pipeline.tick(1_000).unwrap();
        pipeline.tick(1_001).unwrap();

        dependencies.set_available(STORAGE, false);
        let mut ts = 1_002;
        let mut report = pipeline.tick(ts).unwrap();
        while report.mode != Mode::NoTrade && ts < 1_100 {
            ts += 1;
            // keep every other input fresh
            pipeline
                .ingest(spot_tick_envelope("BTC-USD", ts, 60_000.0, Some(ts as u64)), ts as u64, ts)
                .unwrap();
            pipeline
                .ingest(quote_envelope("KXBTC-1", ts, Some(40), Some(55), None), ts as u64, ts)
                .unwrap();
            report = pipeline.tick(ts).unwrap();
        }
        assert_eq!(report.mode, Mode::NoTrade);
        assert_eq!(ts, 1_012); // dependency sustain is 10 s
        assert!(pipeline
            .controller()
            .active_triggers()
            .contains(&"dependency:storage".to_string()));
    }

    #[test]
    fn test_metrics_follow_pipeline() {
        let metrics = MetricsRegistry::new().unwrap();
        let mut pipeline = pipeline().with_metrics(metrics.clone());
        seed_market(&mut pipeline, 1_000);
        pipeline.ingest(serde_json::json!([1]), 3, 1_000).unwrap();
        pipeline.tick(1_000).unwrap();

        assert_eq!(metrics.ingest().envelopes_total.get(), 4);
        assert_eq!(
            metrics
                .ingest()
                .dead_letters_total
                .with_label_values(&["malformed_envelope"])
                .get(),
            1
        );
        assert_eq!(metrics.state().markets.get(), 1);
        assert_eq!(
            metrics.strategy().decisions_total.with_label_values(&["stub"]).get(),
            1
        );
    }

    #[test]
    fn test_checkpoint_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KestrelConfig::default();
        config.checkpoint.path = dir.path().join("checkpoint.json");
        config.checkpoint.every_events = 2;
        config.checkpoint.every_secs = 3_600;
        let builder = StateBuilder::new(config.ingest.clone());
        let mut pipeline = Pipeline::new(&config, builder, StubEvaluator::default(), Vec::new());

        pipeline.ingest(spot_tick_envelope("BTC-USD", 1, 1.0, Some(1)), 0, 1).unwrap();
        assert!(!pipeline.checkpoint_if_due(1).unwrap());
        pipeline.ingest(spot_tick_envelope("BTC-USD", 2, 1.0, Some(2)), 1, 2).unwrap();
        assert!(pipeline.checkpoint_if_due(2).unwrap());
        assert!(!pipeline.checkpoint_if_due(3).unwrap());

        let saved = crate::state::Checkpoint::load(&config.checkpoint.path).unwrap().unwrap();
        assert_eq!(saved.last_offset, Some(1));
    }
}
