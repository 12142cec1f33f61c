//! Prometheus metrics for the decision pipeline
//!
//! Grouped by the component that owns them:
//! - Ingest (envelopes seen, dead-letters)
//! - State (applied / discarded events, tracked markets)
//! - Strategy (edge skips, decisions, sigma fallbacks)
//! - Persistence (batches, items, commit retries)
//! - Health (degraded mode and its transitions)

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "kestrel";

/// Central registry for all pipeline metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    ingest: IngestMetrics,
    state: StateMetrics,
    strategy: StrategyMetrics,
    persistence: PersistenceMetrics,
    health: HealthMetrics,
}

impl MetricsRegistry {
    /// Create a new registry with all metric families registered
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let ingest = IngestMetrics::new(&registry)?;
        let state = StateMetrics::new(&registry)?;
        let strategy = StrategyMetrics::new(&registry)?;
        let persistence = PersistenceMetrics::new(&registry)?;
        let health = HealthMetrics::new(&registry)?;

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            ingest,
            state,
            strategy,
            persistence,
            health,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ingest(&self) -> &IngestMetrics {
        &self.ingest
    }

    pub fn state(&self) -> &StateMetrics {
        &self.state
    }

    pub fn strategy(&self) -> &StrategyMetrics {
        &self.strategy
    }

    pub fn persistence(&self) -> &PersistenceMetrics {
        &self.persistence
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Text exposition format of everything registered
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let metric = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Envelope intake
#[derive(Clone)]
pub struct IngestMetrics {
    /// Raw envelopes handed to the validator
    pub envelopes_total: IntCounter,
    /// Envelopes routed to dead-letter, by reason
    pub dead_letters_total: IntCounterVec,
}

impl IngestMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            envelopes_total: counter(
                registry,
                "ingest_envelopes_total",
                "Total raw envelopes received",
            )?,
            dead_letters_total: counter_vec(
                registry,
                "ingest_dead_letters_total",
                "Envelopes routed to dead-letter",
                &["reason"],
            )?,
        })
    }
}

/// State Builder
#[derive(Clone)]
pub struct StateMetrics {
    /// Events that advanced the projection
    pub applied_total: IntCounterVec,
    /// Stale or duplicate events
    pub discarded_total: IntCounterVec,
    /// Markets currently tracked
    pub markets: IntGauge,
}

impl StateMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            applied_total: counter_vec(
                registry,
                "state_applied_total",
                "Events applied to the projection",
                &["event_type"],
            )?,
            discarded_total: counter_vec(
                registry,
                "state_discarded_total",
                "Events discarded as stale or duplicate",
                &["event_type", "reason"],
            )?,
            markets: gauge(registry, "state_markets", "Markets tracked by the projection")?,
        })
    }
}

/// Edge and Opportunity engines
#[derive(Clone)]
pub struct StrategyMetrics {
    /// Edge snapshots carrying a skip reason, by primary reason
    pub edge_skips_total: IntCounterVec,
    /// Opportunity decisions, by outcome reason
    pub decisions_total: IntCounterVec,
    /// Volatility estimates that fell back, by source
    pub sigma_fallbacks_total: IntCounterVec,
    /// Wall time of one evaluation tick (seconds)
    pub tick_duration_seconds: Histogram,
}

impl StrategyMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let tick_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "strategy_tick_duration_seconds",
                "Wall time of one evaluation tick",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        Ok(Self {
            edge_skips_total: counter_vec(
                registry,
                "strategy_edge_skips_total",
                "Edge snapshots with a skip reason",
                &["reason"],
            )?,
            decisions_total: counter_vec(
                registry,
                "decisions_total",
                "Opportunity decisions by outcome",
                &["outcome"],
            )?,
            sigma_fallbacks_total: counter_vec(
                registry,
                "strategy_sigma_fallbacks_total",
                "Volatility estimates replaced by a fallback",
                &["source"],
            )?,
            tick_duration_seconds,
        })
    }
}

/// Persistence Service
#[derive(Clone)]
pub struct PersistenceMetrics {
    pub batches_total: IntCounter,
    /// Items committed, by result (inserted, duplicate, dead_lettered)
    pub items_total: IntCounterVec,
    pub commit_retries_total: IntCounter,
    /// Items waiting in the writer channel
    pub queue_depth: IntGauge,
}

impl PersistenceMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            batches_total: counter(
                registry,
                "persistence_batches_total",
                "Batches committed",
            )?,
            items_total: counter_vec(
                registry,
                "persistence_items_total",
                "Items committed by result",
                &["result"],
            )?,
            commit_retries_total: counter(
                registry,
                "persistence_commit_retries_total",
                "Batch commits retried after a transient failure",
            )?,
            queue_depth: gauge(
                registry,
                "persistence_queue_depth",
                "Items waiting for the writer",
            )?,
        })
    }
}

/// Degraded-mode controller
#[derive(Clone)]
pub struct HealthMetrics {
    /// 0 healthy, 1 recovering, 2 no_trade
    pub degraded_mode: IntGauge,
    pub degraded_transitions_total: IntCounterVec,
    /// Triggers currently firing
    pub active_triggers: IntGauge,
}

impl HealthMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            degraded_mode: gauge(
                registry,
                "degraded_mode",
                "Degraded mode (0 healthy, 1 recovering, 2 no_trade)",
            )?,
            degraded_transitions_total: counter_vec(
                registry,
                "degraded_transitions_total",
                "Degraded-mode transitions",
                &["from", "to"],
            )?,
            active_triggers: gauge(
                registry,
                "degraded_active_triggers",
                "Degraded-mode triggers currently firing",
            )?,
        })
    }
}
