//! Periodic health line
//!
//! One greppable line per interval:
//!
//! ```text
//! health spot_age_s=3 quote_age_s=NA snapshot_age_s=12 consumer_lag=0 mode=HEALTHY active_triggers=none
//! ```

use super::degraded::{join_or_none, HealthSample, Mode};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthLine {
    pub spot_age_s: Option<f64>,
    pub quote_age_s: Option<f64>,
    pub snapshot_age_s: Option<f64>,
    pub consumer_lag_s: Option<f64>,
    pub mode: Mode,
    pub active_triggers: Vec<String>,
}

impl HealthLine {
    pub fn new(sample: &HealthSample, mode: Mode, active_triggers: Vec<String>) -> Self {
        Self {
            spot_age_s: sample.spot_age_s,
            quote_age_s: sample.quote_age_s,
            snapshot_age_s: sample.snapshot_age_s,
            consumer_lag_s: sample.consumer_lag_s,
            mode,
            active_triggers,
        }
    }
}

struct Age(Option<f64>);

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) if v.is_finite() => write!(f, "{}", v.round() as i64),
            _ => f.write_str("NA"),
        }
    }
}

impl fmt::Display for HealthLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "health spot_age_s={} quote_age_s={} snapshot_age_s={} consumer_lag={} mode={} active_triggers={}",
            Age(self.spot_age_s),
            Age(self.quote_age_s),
            Age(self.snapshot_age_s),
            Age(self.consumer_lag_s),
            self.mode,
            join_or_none(&self.active_triggers),
        )
    }
}

/// Emits the health line at most once per interval
#[derive(Debug, Clone)]
pub struct HealthReporter {
    interval_s: i64,
    last_ts: Option<i64>,
}

impl HealthReporter {
    pub fn new(interval_s: i64) -> Self {
        Self {
            interval_s,
            last_ts: None,
        }
    }

    pub fn is_due(&mut self, now: i64) -> bool {
        match self.last_ts {
            Some(last) if now - last < self.interval_s => false,
            _ => {
                self.last_ts = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_missing_values() {
        let mut sample = HealthSample::healthy(0);
        sample.spot_age_s = Some(3.2);
        sample.quote_age_s = None;
        sample.snapshot_age_s = Some(12.0);
        let line = HealthLine::new(&sample, Mode::Healthy, vec![]);

        assert_eq!(
            line.to_string(),
            "health spot_age_s=3 quote_age_s=NA snapshot_age_s=12 consumer_lag=0 mode=HEALTHY active_triggers=none"
        );
    }

    #[test]
    fn test_format_lists_triggers() {
        let line = HealthLine::new(
            &HealthSample::healthy(0),
            Mode::NoTrade,
            vec!["consumer_lag".into(), "dependency:storage".into()],
        );
        assert!(line
            .to_string()
            .ends_with("mode=NO_TRADE active_triggers=consumer_lag,dependency:storage"));
    }

    #[test]
    fn test_reporter_interval() {
        let mut reporter = HealthReporter::new(10);
        assert!(reporter.is_due(100));
        assert!(!reporter.is_due(105));
        assert!(reporter.is_due(110));
    }
}
