//! Resilience: keeping the pipeline safe when its inputs are not
//!
//! - Degraded-mode controller gating new entries, with hysteresis
//! - Periodic health line
//! - Dependency availability flags
//! - Exponential backoff for storage retries
//! - Process shutdown switch

pub mod backoff;
pub mod degraded;
pub mod dependency;
pub mod health;
pub mod shutdown;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use degraded::{
    DegradedModeController, DegradedModeState, EntryGate, HealthSample, Mode, ModeTransition,
    SustainWindow, TriggerKind, STARTUP_TRIGGER,
};
pub use dependency::{DependencyHealth, STORAGE};
pub use health::{HealthLine, HealthReporter};
pub use shutdown::{ShutdownState, ShutdownSwitch};
