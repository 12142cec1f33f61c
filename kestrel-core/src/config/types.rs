use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KestrelConfig {
    pub ingest: IngestConfig,
    pub edge: EdgeConfig,
    pub opportunity: OpportunityConfig,
    pub persistence: PersistenceConfig,
    pub degraded: DegradedConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

/// Event ingestion and projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Underlying product for markets without a prefix mapping
    pub default_product: String,

    /// Market-id prefix → product (longest prefix wins)
    pub product_prefixes: Vec<ProductPrefix>,

    /// Spot points kept per product for volatility estimation
    pub spot_history_max_points: usize,

    /// Spot points older than this (relative to the newest) are dropped
    pub spot_history_retention_s: i64,

    /// Capacity of the channel into the persistence service
    pub channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_product: "BTC-USD".to_string(),
            product_prefixes: Vec::new(),
            spot_history_max_points: 20_000,
            spot_history_retention_s: 7_200, // 2h, covers the 1h lookback
            channel_capacity: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn product_for(&self, market_id: &str) -> String {
        self.product_prefixes
            .iter()
            .filter(|p| market_id.starts_with(p.prefix.as_str()))
            .max_by_key(|p| p.prefix.len())
            .map(|p| p.product.clone())
            .unwrap_or_else(|| self.default_product.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPrefix {
    pub prefix: String,
    pub product: String,
}

impl ProductPrefix {
    pub fn new(prefix: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            product: product.into(),
        }
    }
}

/// Volatility estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    /// Spot history window used for the estimate
    pub lookback_s: i64,

    /// Bucket width for last-price resampling
    pub resample_s: i64,

    /// EWMA decay (RiskMetrics style)
    pub ewma_lambda: f64,

    /// Minimum resampled prices
    pub min_points: usize,

    /// Minimum time covered by the resampled series
    pub min_span_s: i64,

    /// Annualized ceiling; anything above is rejected
    pub sigma_max: f64,

    /// Conservative fallback when no accepted estimate exists
    pub sigma_default: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            lookback_s: 3_600,
            resample_s: 5,
            ewma_lambda: 0.94,
            min_points: 30,
            min_span_s: 600,
            sigma_max: 5.0,
            sigma_default: 0.80,
        }
    }
}

/// Edge engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Stamped on every snapshot and decision; part of their unique keys
    pub strategy_version: String,

    pub max_spot_age_s: f64,
    pub max_quote_age_s: f64,

    /// Settlement this far in the past still counts as "at expiry"
    pub expiry_grace_s: i64,

    /// Contracts the fee is evaluated for
    pub contracts: u32,

    pub volatility: VolatilityConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            strategy_version: "edge-v1".to_string(),
            max_spot_age_s: 10.0,
            max_quote_age_s: 30.0,
            expiry_grace_s: 5,
            contracts: 1,
            volatility: VolatilityConfig::default(),
        }
    }
}

/// Opportunity gating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityConfig {
    /// Minimum net EV per contract to trade
    pub min_ev: f64,

    pub max_horizon_s: i64,

    /// Maximum bid/ask spread in probability units (0.06 = 6 ticks)
    pub max_spread: f64,

    pub quote_freshness_s: f64,

    /// No new entries this close to settlement
    pub no_new_entries_last_s: i64,

    /// Tradable ask band in probability units; a side priced outside it has no EV
    pub min_ask: f64,
    pub max_ask: f64,
}

impl Default for OpportunityConfig {
    fn default() -> Self {
        Self {
            min_ev: 0.03,
            max_horizon_s: 3_600,
            max_spread: 0.06,
            quote_freshness_s: 30.0,
            no_new_entries_last_s: 120,
            min_ask: 0.01,
            max_ask: 0.99,
        }
    }
}

/// Retry backoff for storage commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
    /// 0.0 to 1.0
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_retries: 8,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Single-writer persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub db_path: PathBuf,

    /// Stream name consumer offsets are committed under
    pub stream: String,

    pub batch_max_wait_ms: u64,
    pub batch_max_items: usize,
    /// Never commit more than this many items in one transaction
    pub batch_hard_ceiling: usize,

    pub retry: RetryConfig,

    /// Drain budget on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/kestrel.db"),
            stream: "market".to_string(),
            batch_max_wait_ms: 100,
            batch_max_items: 500,
            batch_hard_ceiling: 2_000,
            retry: RetryConfig::default(),
            shutdown_grace_ms: 5_000,
        }
    }
}

impl PersistenceConfig {
    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Threshold that must be breached continuously for `sustain_s`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerThreshold {
    pub threshold: f64,
    pub sustain_s: i64,
}

impl TriggerThreshold {
    pub const fn new(threshold: f64, sustain_s: i64) -> Self {
        Self {
            threshold,
            sustain_s,
        }
    }
}

/// Degraded-mode controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedConfig {
    /// Seconds behind the producer
    pub consumer_lag: TriggerThreshold,
    pub spot_age: TriggerThreshold,
    pub quote_age: TriggerThreshold,
    pub snapshot_age: TriggerThreshold,

    /// Minimum fraction of tradable markets with a fresh quote
    pub quote_coverage_min: f64,
    pub quote_coverage_sustain_s: i64,

    pub dependency_sustain_s: i64,

    /// Continuous all-healthy time before returning to HEALTHY
    pub hold_s: i64,

    /// Pass through RECOVERING (shadow entries) on the way back
    pub shadow_recovery: bool,

    /// Start in NO_TRADE until the first healthy hold completes
    pub start_in_no_trade: bool,

    pub health_interval_s: i64,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            consumer_lag: TriggerThreshold::new(30.0, 60),
            spot_age: TriggerThreshold::new(10.0, 15),
            quote_age: TriggerThreshold::new(30.0, 30),
            snapshot_age: TriggerThreshold::new(60.0, 30),
            quote_coverage_min: 0.80,
            quote_coverage_sustain_s: 60,
            dependency_sustain_s: 10,
            hold_s: 300, // 5 minutes
            shadow_recovery: true,
            start_in_no_trade: true,
            health_interval_s: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    pub every_events: u64,
    pub every_secs: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/checkpoint.json"),
            every_events: 5_000,
            every_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
