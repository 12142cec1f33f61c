//! Batch accumulation policy
//!
//! A batch closes when it has waited `max_wait` since its first item or
//! holds `max_items`, whichever comes first. No single commit ever exceeds
//! `hard_ceiling` items.

use super::store::PersistItem;
use crate::config::PersistenceConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_wait: Duration,
    pub max_items: usize,
    pub hard_ceiling: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for BatchPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_wait: config.batch_max_wait(),
            max_items: config.batch_max_items,
            hard_ceiling: config.batch_hard_ceiling.max(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct Batch {
    items: Vec<PersistItem>,
    opened_at: Option<Instant>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: PersistItem) {
        if self.items.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self, policy: &BatchPolicy) -> bool {
        self.items.len() >= policy.max_items.min(policy.hard_ceiling)
    }

    /// When the batch must be flushed; `None` while empty
    pub fn deadline(&self, policy: &BatchPolicy) -> Option<Instant> {
        self.opened_at.map(|opened| opened + policy.max_wait)
    }

    /// Take up to `hard_ceiling` items off the front
    pub fn take_chunk(&mut self, policy: &BatchPolicy) -> Vec<PersistItem> {
        let n = self.items.len().min(policy.hard_ceiling);
        let chunk: Vec<PersistItem> = self.items.drain(..n).collect();
        if self.items.is_empty() {
            self.opened_at = None;
        } else {
            // leftovers are already overdue
            self.opened_at = Some(
                Instant::now()
                    .checked_sub(policy.max_wait)
                    .unwrap_or_else(Instant::now),
            );
        }
        chunk
    }
}
