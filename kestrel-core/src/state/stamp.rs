//! Monotonic field stamps
//!
//! Each projected field group remembers the `(ts, idempotency_key)` of the
//! event that last wrote it. An incoming event is admitted only if it is
//! strictly newer, or equally new with a lexically greater key.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamp {
    pub ts: i64,
    pub key: String,
}

/// Result of offering an event to the projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State advanced
    Applied,
    /// Older than the current state, or lost the equal-timestamp tie-break
    Stale,
    /// Same key as the event already applied
    Duplicate,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Stale => "stale",
            ApplyOutcome::Duplicate => "duplicate",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

impl FieldStamp {
    pub fn new(ts: i64, key: impl Into<String>) -> Self {
        Self { ts, key: key.into() }
    }

    /// Decide whether an event at `ts` with `key` may overwrite `current`
    pub fn admit(current: Option<&FieldStamp>, ts: i64, key: &str) -> ApplyOutcome {
        let Some(current) = current else {
            return ApplyOutcome::Applied;
        };

        match ts.cmp(&current.ts) {
            Ordering::Less => ApplyOutcome::Stale,
            Ordering::Greater => ApplyOutcome::Applied,
            Ordering::Equal => match key.cmp(current.key.as_str()) {
                Ordering::Greater => ApplyOutcome::Applied,
                Ordering::Equal => ApplyOutcome::Duplicate,
                Ordering::Less => ApplyOutcome::Stale,
            },
        }
    }
}
