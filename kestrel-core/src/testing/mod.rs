//! Testing utilities for unit and integration tests
//!
//! Provides:
//! - Envelope builders for every inbound event type
//! - A validating shortcut from envelope to `MarketEvent`
//! - A scripted store that fails commits on demand

pub mod helpers;

pub use helpers::*;
