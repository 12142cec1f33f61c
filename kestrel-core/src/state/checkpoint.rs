//! Projection checkpoints
//!
//! A checkpoint is the serialized projection plus the offset of the last
//! event applied to it. Recovery loads the newest checkpoint and replays the
//! stream tail; because apply is idempotent, replaying a little too much is
//! harmless, replaying too little is not.

use super::projection::{MarketProjection, Projection, SpotPoint, SpotState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub created_ts: i64,
    pub last_offset: Option<u64>,
    pub markets: BTreeMap<String, MarketProjection>,
    pub spots: BTreeMap<String, SpotState>,
    pub spot_history: BTreeMap<String, Vec<SpotPoint>>,
}

impl Checkpoint {
    pub(crate) fn capture(projection: &Projection, last_offset: Option<u64>, created_ts: i64) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            created_ts,
            last_offset,
            markets: projection
                .markets
                .iter()
                .map(|(id, market)| (id.clone(), market.as_ref().clone()))
                .collect(),
            spots: projection.spots.clone(),
            spot_history: projection
                .spot_history
                .iter()
                .map(|(id, history)| (id.clone(), history.iter().copied().collect()))
                .collect(),
        }
    }

    pub(crate) fn into_projection(self) -> Projection {
        Projection {
            markets: self
                .markets
                .into_iter()
                .map(|(id, market)| (id, Arc::new(market)))
                .collect(),
            spots: self.spots,
            spot_history: self
                .spot_history
                .into_iter()
                .map(|(id, history)| (id, history.into_iter().collect()))
                .collect(),
        }
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, self)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        info!(
            path = %path.display(),
            markets = self.markets.len(),
            last_offset = ?self.last_offset,
            "checkpoint written"
        );
        Ok(())
    }

    /// `Ok(None)` when no checkpoint exists yet
    pub fn load(path: &Path) -> Result<Option<Self>, CheckpointError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(checkpoint.format_version));
        }
        Ok(Some(checkpoint))
    }
}

/// First stream offset to replay after a restart
///
/// Both the projection and durable storage must catch up, so replay starts
/// after whichever of them is further behind. With either one missing the
/// whole stream is replayed.
pub fn replay_start(checkpoint_offset: Option<u64>, committed_offset: Option<u64>) -> u64 {
    match (checkpoint_offset, committed_offset) {
        (Some(a), Some(b)) => a.min(b) + 1,
        _ => 0,
    }
}

/// Checkpoint cadence: every N events or every T seconds, whichever first
#[derive(Debug, Clone)]
pub struct CheckpointSchedule {
    every_events: u64,
    every_secs: i64,
    events_since: u64,
    last_ts: i64,
}

impl CheckpointSchedule {
    pub fn new(every_events: u64, every_secs: i64, now: i64) -> Self {
        Self {
            every_events,
            every_secs,
            events_since: 0,
            last_ts: now,
        }
    }

    pub fn record_event(&mut self) {
        self.events_since += 1;
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.events_since > 0
            && (self.events_since >= self.every_events || now - self.last_ts >= self.every_secs)
    }

    pub fn mark_written(&mut self, now: i64) {
        self.events_since = 0;
        self.last_ts = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::state::StateBuilder;
    use crate::testing::{quote_envelope, spot_tick_envelope, validated};

    #[test]
    fn test_round_trip_restores_identical_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoint.json");

        let mut builder = StateBuilder::new(IngestConfig::default());
        builder.apply_at(&validated(spot_tick_envelope("BTC-USD", 1_000, 60_000.0, Some(1))), 0);
        builder.apply_at(&validated(quote_envelope("M1", 1_001, Some(40), Some(55), None)), 1);
        let checkpoint = builder.checkpoint(1_002);
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        let restored = StateBuilder::from_checkpoint(IngestConfig::default(), loaded);
        assert_eq!(restored.last_offset(), Some(1));
        assert_eq!(
            restored.get_snapshot("M1", 1_010),
            builder.get_snapshot("M1", 1_010)
        );
        assert_eq!(restored.reader().spot_history("BTC-USD", 0).len(), 1);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("nope.json")).unwrap().is_none());
    }

    #[test]
    fn test_replay_starts_after_the_lagging_side() {
        assert_eq!(replay_start(Some(100), Some(80)), 81);
        assert_eq!(replay_start(Some(50), Some(80)), 51);
        assert_eq!(replay_start(None, Some(80)), 0);
        assert_eq!(replay_start(Some(80), None), 0);
    }

    #[test]
    fn test_schedule_by_count_or_time() {
        let mut schedule = CheckpointSchedule::new(3, 60, 0);
        assert!(!schedule.is_due(1_000), "nothing new to checkpoint");

        schedule.record_event();
        schedule.record_event();
        assert!(!schedule.is_due(10));
        schedule.record_event();
        assert!(schedule.is_due(10));

        schedule.mark_written(10);
        schedule.record_event();
        assert!(!schedule.is_due(69));
        assert!(schedule.is_due(70));
    }
}
