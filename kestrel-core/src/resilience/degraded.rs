//! Degraded-Mode Controller
//!
//! Process-wide state machine that gates new trade entries.
//!
//! ## State Transitions
//!
//! ```text
//!   HEALTHY ──any trigger fires──▶ NO_TRADE
//!   NO_TRADE ──all clear──▶ RECOVERING        (shadow_recovery)
//!   NO_TRADE ──hold_s of health──▶ HEALTHY    (!shadow_recovery)
//!   RECOVERING ──hold_s of health──▶ HEALTHY
//!   RECOVERING ──any trigger fires──▶ NO_TRADE
//! ```
//!
//! A trigger fires only after its threshold has been breached continuously
//! for its sustain window. The recovery hold restarts on any breach, fired or
//! not, so a flapping metric can never walk the controller back to HEALTHY.
//!
//! The controller is driven by explicit samples carrying their own clock and
//! never reads wall time, which keeps every transition reproducible.

use crate::config::{DegradedConfig, TriggerThreshold};
use crate::monitoring::HealthMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::info;

/// Trigger present from startup until the first all-healthy sample
pub const STARTUP_TRIGGER: &str = "startup";

/// Controller mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Healthy,
    Recovering,
    NoTrade,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Healthy => "HEALTHY",
            Mode::Recovering => "RECOVERING",
            Mode::NoTrade => "NO_TRADE",
        }
    }

    /// Value exported on the `kestrel_degraded_mode` gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            Mode::Healthy => 0,
            Mode::Recovering => 1,
            Mode::NoTrade => 2,
        }
    }

    pub fn gate(&self) -> EntryGate {
        match self {
            Mode::Healthy => EntryGate::Open,
            Mode::Recovering => EntryGate::Shadow,
            Mode::NoTrade => EntryGate::Closed,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the Opportunity Engine may do with a new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryGate {
    /// Entries allowed
    Open,
    /// Decisions computed and recorded, but marked shadow
    Shadow,
    /// No new entries
    Closed,
}

impl EntryGate {
    pub fn allows_entries(&self) -> bool {
        !matches!(self, EntryGate::Closed)
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, EntryGate::Shadow)
    }
}

/// Health metric a trigger watches
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    ConsumerLag,
    SpotAge,
    QuoteAge,
    SnapshotAge,
    QuoteCoverage,
    Dependency(String),
}

impl TriggerKind {
    pub fn name(&self) -> String {
        match self {
            TriggerKind::ConsumerLag => "consumer_lag".to_string(),
            TriggerKind::SpotAge => "spot_age".to_string(),
            TriggerKind::QuoteAge => "quote_age".to_string(),
            TriggerKind::SnapshotAge => "snapshot_age".to_string(),
            TriggerKind::QuoteCoverage => "quote_coverage".to_string(),
            TriggerKind::Dependency(name) => format!("dependency:{name}"),
        }
    }
}

/// Tracks how long a threshold has been continuously breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SustainWindow {
    sustain_s: i64,
    breach_since: Option<i64>,
}

impl SustainWindow {
    pub fn new(sustain_s: i64) -> Self {
        Self {
            sustain_s,
            breach_since: None,
        }
    }

    /// Record one observation; returns whether the trigger is firing
    pub fn observe(&mut self, breached: bool, now: i64) -> bool {
        if !breached {
            self.breach_since = None;
            return false;
        }
        let since = *self.breach_since.get_or_insert(now);
        now - since >= self.sustain_s
    }

    pub fn breach_since(&self) -> Option<i64> {
        self.breach_since
    }
}

/// One observation of the pipeline's health
///
/// Ages and lag are seconds. `None` means the metric could not be computed,
/// which for ages and lag counts as a breach. Unknown coverage is healthy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthSample {
    pub now: i64,
    pub spot_age_s: Option<f64>,
    pub quote_age_s: Option<f64>,
    pub snapshot_age_s: Option<f64>,
    pub consumer_lag_s: Option<f64>,
    pub quote_coverage: Option<f64>,
    /// Dependency name → available
    pub dependencies: BTreeMap<String, bool>,
}

impl HealthSample {
    /// Sample with every metric at zero and no dependencies
    pub fn healthy(now: i64) -> Self {
        Self {
            now,
            spot_age_s: Some(0.0),
            quote_age_s: Some(0.0),
            snapshot_age_s: Some(0.0),
            consumer_lag_s: Some(0.0),
            quote_coverage: None,
            dependencies: BTreeMap::new(),
        }
    }
}

/// Inspectable controller state
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedModeState {
    pub mode: Mode,
    pub active_triggers: Vec<String>,
    pub since_ts: Option<i64>,
    pub healthy_since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    pub ts: i64,
    pub triggers: Vec<String>,
}

pub struct DegradedModeController {
    config: DegradedConfig,
    mode: Mode,
    since_ts: Option<i64>,
    windows: BTreeMap<TriggerKind, SustainWindow>,
    active: BTreeSet<String>,
    startup_pending: bool,
    healthy_since: Option<i64>,
    metrics: Option<HealthMetrics>,
}

impl DegradedModeController {
    pub fn new(config: DegradedConfig) -> Self {
        let startup_pending = config.start_in_no_trade;
        let mut active = BTreeSet::new();
        if startup_pending {
            active.insert(STARTUP_TRIGGER.to_string());
        }

        Self {
            mode: if startup_pending { Mode::NoTrade } else { Mode::Healthy },
            since_ts: None,
            windows: BTreeMap::new(),
            active,
            startup_pending,
            healthy_since: None,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: HealthMetrics) -> Self {
        metrics.degraded_mode.set(self.mode.gauge_value());
        metrics.active_triggers.set(self.active.len() as i64);
        self.metrics = Some(metrics);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn gate(&self) -> EntryGate {
        self.mode.gate()
    }

    pub fn active_triggers(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    pub fn state(&self) -> DegradedModeState {
        DegradedModeState {
            mode: self.mode,
            active_triggers: self.active_triggers(),
            since_ts: self.since_ts,
            healthy_since: self.healthy_since,
        }
    }

    /// Feed one sample; returns the transition it caused, if any
    pub fn observe(&mut self, sample: &HealthSample) -> Option<ModeTransition> {
        let now = sample.now;
        let mut any_breach = false;
        let mut firing = BTreeSet::new();

        let age_checks = [
            (TriggerKind::ConsumerLag, sample.consumer_lag_s, self.config.consumer_lag),
            (TriggerKind::SpotAge, sample.spot_age_s, self.config.spot_age),
            (TriggerKind::QuoteAge, sample.quote_age_s, self.config.quote_age),
            (TriggerKind::SnapshotAge, sample.snapshot_age_s, self.config.snapshot_age),
        ];
        for (kind, value, threshold) in age_checks {
            let breached = age_breached(value, threshold);
            any_breach |= breached;
            if self.window(&kind, threshold.sustain_s).observe(breached, now) {
                firing.insert(kind.name());
            }
        }

        let coverage_breached = sample
            .quote_coverage
            .map_or(false, |c| c < self.config.quote_coverage_min);
        any_breach |= coverage_breached;
        let sustain = self.config.quote_coverage_sustain_s;
        if self
            .window(&TriggerKind::QuoteCoverage, sustain)
            .observe(coverage_breached, now)
        {
            firing.insert(TriggerKind::QuoteCoverage.name());
        }

        let sustain = self.config.dependency_sustain_s;
        for (name, available) in &sample.dependencies {
            let kind = TriggerKind::Dependency(name.clone());
            any_breach |= !available;
            if self.window(&kind, sustain).observe(!available, now) {
                firing.insert(kind.name());
            }
        }
        // a dependency that stops being reported is no longer breached
        for (kind, window) in self.windows.iter_mut() {
            if let TriggerKind::Dependency(name) = kind {
                if !sample.dependencies.contains_key(name) {
                    window.observe(false, now);
                }
            }
        }

        if self.startup_pending {
            if any_breach {
                firing.insert(STARTUP_TRIGGER.to_string());
            } else {
                self.startup_pending = false;
            }
        }

        self.healthy_since = if any_breach {
            None
        } else {
            Some(self.healthy_since.unwrap_or(now))
        };
        self.active = firing;

        let held = self
            .healthy_since
            .map_or(false, |since| now - since >= self.config.hold_s);
        let clear = self.active.is_empty() && !any_breach;

        let next = match self.mode {
            Mode::Healthy if !self.active.is_empty() => Mode::NoTrade,
            Mode::NoTrade if clear && self.config.shadow_recovery => {
                if held {
                    Mode::Healthy
                } else {
                    Mode::Recovering
                }
            }
            Mode::NoTrade if clear && held => Mode::Healthy,
            Mode::Recovering if !self.active.is_empty() => Mode::NoTrade,
            Mode::Recovering if held => Mode::Healthy,
            current => current,
        };

        if let Some(metrics) = &self.metrics {
            metrics.active_triggers.set(self.active.len() as i64);
        }

        if next == self.mode {
            return None;
        }
        Some(self.transition(next, now))
    }

    fn window(&mut self, kind: &TriggerKind, sustain_s: i64) -> &mut SustainWindow {
        self.windows
            .entry(kind.clone())
            .or_insert_with(|| SustainWindow::new(sustain_s))
    }

    fn transition(&mut self, to: Mode, now: i64) -> ModeTransition {
        let transition = ModeTransition {
            from: self.mode,
            to,
            ts: now,
            triggers: self.active_triggers(),
        };
        self.mode = to;
        self.since_ts = Some(now);

        info!(
            from = %transition.from,
            to = %transition.to,
            ts = now,
            triggers = %join_or_none(&transition.triggers),
            "degraded mode transition"
        );

        if let Some(metrics) = &self.metrics {
            metrics.degraded_mode.set(to.gauge_value());
            metrics
                .degraded_transitions_total
                .with_label_values(&[transition.from.as_str(), to.as_str()])
                .inc();
        }

        transition
    }
}

fn age_breached(value: Option<f64>, threshold: TriggerThreshold) -> bool {
    value.map_or(true, |v| v > threshold.threshold)
}

pub(crate) fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(",")
    }
}
