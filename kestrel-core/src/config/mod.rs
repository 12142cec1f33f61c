pub mod types;

pub use types::*;

use ::config::{Config as ConfigLoader, Environment, File};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(ConfigError::Invalid(format!($($arg)+)));
        }
    };
}

impl KestrelConfig {
    /// Load configuration from an optional TOML file with environment overrides
    ///
    /// Precedence (lowest first): built-in defaults, the file, then
    /// `KESTREL__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        if let Some(config_path) = path {
            builder = builder.add_source(File::from(config_path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("KESTREL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: KestrelConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Ingest
        ensure!(
            !self.ingest.default_product.trim().is_empty(),
            "ingest.default_product must not be empty"
        );
        ensure!(
            self.ingest.spot_history_max_points >= 2,
            "ingest.spot_history_max_points must be at least 2"
        );
        ensure!(self.ingest.channel_capacity > 0, "ingest.channel_capacity must be positive");

        // Edge
        let vol = &self.edge.volatility;
        ensure!(
            !self.edge.strategy_version.trim().is_empty(),
            "edge.strategy_version must not be empty"
        );
        ensure!(self.edge.contracts > 0, "edge.contracts must be positive");
        ensure!(
            vol.ewma_lambda > 0.0 && vol.ewma_lambda < 1.0,
            "edge.volatility.ewma_lambda must be in (0, 1), got {}",
            vol.ewma_lambda
        );
        ensure!(vol.resample_s > 0, "edge.volatility.resample_s must be positive");
        ensure!(vol.min_points >= 2, "edge.volatility.min_points must be at least 2");
        ensure!(
            vol.sigma_default > 0.0 && vol.sigma_default <= vol.sigma_max,
            "edge.volatility.sigma_default must be in (0, sigma_max]"
        );
        ensure!(
            self.ingest.spot_history_retention_s >= vol.lookback_s,
            "ingest.spot_history_retention_s must cover edge.volatility.lookback_s"
        );

        // Opportunity
        ensure!(
            self.opportunity.max_spread >= 0.0 && self.opportunity.max_spread <= 1.0,
            "opportunity.max_spread must be in [0, 1]"
        );
        ensure!(self.opportunity.max_horizon_s > 0, "opportunity.max_horizon_s must be positive");
        ensure!(
            self.opportunity.no_new_entries_last_s >= 0,
            "opportunity.no_new_entries_last_s must not be negative"
        );
        ensure!(
            self.opportunity.min_ask > 0.0
                && self.opportunity.min_ask <= self.opportunity.max_ask
                && self.opportunity.max_ask < 1.0,
            "opportunity ask band must satisfy 0 < min_ask <= max_ask < 1"
        );

        // Persistence
        let persistence = &self.persistence;
        ensure!(persistence.batch_max_items > 0, "persistence.batch_max_items must be positive");
        ensure!(
            persistence.batch_hard_ceiling >= persistence.batch_max_items,
            "persistence.batch_hard_ceiling must be >= batch_max_items"
        );
        ensure!(
            persistence.retry.multiplier >= 1.0,
            "persistence.retry.multiplier must be >= 1.0"
        );
        ensure!(
            (0.0..=1.0).contains(&persistence.retry.jitter_factor),
            "persistence.retry.jitter_factor must be in [0, 1]"
        );

        // Degraded mode
        let degraded = &self.degraded;
        ensure!(degraded.hold_s > 0, "degraded.hold_s must be positive");
        ensure!(
            (0.0..=1.0).contains(&degraded.quote_coverage_min),
            "degraded.quote_coverage_min must be in [0, 1]"
        );
        for (name, trigger) in [
            ("consumer_lag", degraded.consumer_lag),
            ("spot_age", degraded.spot_age),
            ("quote_age", degraded.quote_age),
            ("snapshot_age", degraded.snapshot_age),
        ] {
            ensure!(trigger.threshold > 0.0, "degraded.{name}.threshold must be positive");
            ensure!(trigger.sustain_s >= 0, "degraded.{name}.sustain_s must not be negative");
        }

        // Logging
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        ensure!(
            valid_log_levels.contains(&self.logging.level.as_str()),
            "Invalid log level '{}', must be one of: {:?}",
            self.logging.level,
            valid_log_levels
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        KestrelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = KestrelConfig::default();
        assert_eq!(cfg.opportunity.min_ev, 0.03);
        assert_eq!(cfg.opportunity.max_horizon_s, 3_600);
        assert_eq!(cfg.opportunity.no_new_entries_last_s, 120);
        assert_eq!(cfg.opportunity.min_ask, 0.01);
        assert_eq!(cfg.opportunity.max_ask, 0.99);
        assert_eq!(cfg.degraded.consumer_lag.threshold, 30.0);
        assert_eq!(cfg.degraded.hold_s, 300);
        assert_eq!(cfg.degraded.quote_coverage_min, 0.80);
        assert_eq!(cfg.persistence.batch_max_items, 500);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[opportunity]
min_ev = 0.05

[degraded]
hold_s = 120

[[ingest.product_prefixes]]
prefix = "KXETH"
product = "ETH-USD"
"#
        )
        .unwrap();

        let cfg = KestrelConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.opportunity.min_ev, 0.05);
        assert_eq!(cfg.degraded.hold_s, 120);
        // untouched sections keep defaults
        assert_eq!(cfg.opportunity.max_spread, 0.06);
        assert_eq!(cfg.ingest.product_for("KXETH-24JAN01"), "ETH-USD");
        assert_eq!(cfg.ingest.product_for("KXBTC-24JAN01"), "BTC-USD");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut cfg = KestrelConfig::default();
        cfg.edge.volatility.ewma_lambda = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = KestrelConfig::default();
        cfg.persistence.batch_hard_ceiling = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = KestrelConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());

        let mut cfg = KestrelConfig::default();
        cfg.opportunity.min_ask = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut ingest = IngestConfig::default();
        ingest.product_prefixes.push(ProductPrefix::new("KX", "BTC-USD"));
        ingest.product_prefixes.push(ProductPrefix::new("KXETH", "ETH-USD"));
        assert_eq!(ingest.product_for("KXETH-1"), "ETH-USD");
        assert_eq!(ingest.product_for("KXSOL-1"), "BTC-USD");
        assert_eq!(ingest.product_for("OTHER"), "BTC-USD");
    }
}
