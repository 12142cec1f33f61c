//! Monitoring and observability
//!
//! Prometheus metrics owned per pipeline instance. Nothing registers into the
//! global default registry, so tests never see each other's counters.

pub mod metrics;

pub use metrics::{
    HealthMetrics, IngestMetrics, MetricsRegistry, PersistenceMetrics, StateMetrics,
    StrategyMetrics,
};
