//! Availability flags for external dependencies
//!
//! Components that talk to something outside the process (the store, the
//! upstream log) flip their flag here; the pipeline copies the flags into
//! each health sample.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const STORAGE: &str = "storage";

#[derive(Clone, Default)]
pub struct DependencyHealth {
    flags: Arc<RwLock<BTreeMap<String, bool>>>,
}

impl DependencyHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reporting a dependency as available
    pub fn register(&self, name: &str) {
        self.flags.write().entry(name.to_string()).or_insert(true);
    }

    pub fn set_available(&self, name: &str, available: bool) {
        self.flags.write().insert(name.to_string(), available);
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.flags.read().get(name).copied().unwrap_or(true)
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.flags.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_shared_between_clones() {
        let health = DependencyHealth::new();
        let writer = health.clone();
        writer.register(STORAGE);
        assert!(health.is_available(STORAGE));

        writer.set_available(STORAGE, false);
        assert!(!health.is_available(STORAGE));
        assert_eq!(health.snapshot().get(STORAGE), Some(&false));
    }
}
