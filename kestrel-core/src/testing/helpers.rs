//! Test helper utilities for creating envelopes and stores
//!
//! Envelopes are built with `source = "test"` and `ts_produced == ts_event`
//! unless stated otherwise, so consumer lag is zero at `now == ts`.

use crate::data::{DeadLetterRecord, DeadLetterStore, EnvelopeValidator};
use crate::events::MarketEvent;
use crate::persistence::{BatchOutcome, EventStore, PersistItem, StorageError};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Spot tick envelope; `seq` gives it a stable identity tuple
pub fn spot_tick_envelope(product_id: &str, ts: i64, price: f64, seq: Option<u64>) -> Value {
    let mut payload = Map::new();
    payload.insert("ts".into(), json!(ts));
    payload.insert("product_id".into(), json!(product_id));
    payload.insert("price".into(), json!(price));
    if let Some(seq) = seq {
        payload.insert("sequence_num".into(), json!(seq));
    }
    envelope("spot_tick", ts, Value::Object(payload))
}

/// Quote envelope with bids in integer cents
pub fn quote_envelope(
    market_id: &str,
    ts: i64,
    yes_bid: Option<u32>,
    no_bid: Option<u32>,
    msg_id: Option<&str>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("ts".into(), json!(ts));
    payload.insert("market_id".into(), json!(market_id));
    if let Some(bid) = yes_bid {
        payload.insert("yes_bid".into(), json!(bid));
    }
    if let Some(bid) = no_bid {
        payload.insert("no_bid".into(), json!(bid));
    }
    if let Some(id) = msg_id {
        payload.insert("source_msg_id".into(), json!(id));
    }
    envelope("quote_update", ts, Value::Object(payload))
}

pub fn lifecycle_envelope(market_id: &str, ts_event: i64, status: &str, close_ts: Option<i64>) -> Value {
    let mut payload = Map::new();
    payload.insert("market_id".into(), json!(market_id));
    payload.insert("status".into(), json!(status));
    if let Some(close) = close_ts {
        payload.insert("close_ts".into(), json!(close));
    }
    envelope("market_lifecycle", ts_event, Value::Object(payload))
}

pub fn contract_envelope(
    ticker: &str,
    ts_event: i64,
    strike_type: &str,
    lower: Option<f64>,
    upper: Option<f64>,
    close_ts: Option<i64>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("ticker".into(), json!(ticker));
    payload.insert("strike_type".into(), json!(strike_type));
    if let Some(lower) = lower {
        payload.insert("lower".into(), json!(lower));
    }
    if let Some(upper) = upper {
        payload.insert("upper".into(), json!(upper));
    }
    if let Some(close) = close_ts {
        payload.insert("close_ts".into(), json!(close));
    }
    envelope("contract_update", ts_event, Value::Object(payload))
}

fn envelope(event_type: &str, ts: i64, payload: Value) -> Value {
    json!({
        "event_type": event_type,
        "schema_version": 1,
        "ts_event": ts,
        "ts_produced": ts,
        "source": "test",
        "payload": payload,
    })
}

/// Validate an envelope that the test expects to be valid
///
/// # Panics
/// If the envelope fails validation.
#[allow(clippy::panic)]
pub fn validated(raw: Value) -> MarketEvent {
    match EnvelopeValidator::new().validate(&raw) {
        Ok(event) => event,
        Err(e) => panic!("test envelope failed validation: {e}"),
    }
}

/// In-memory [`EventStore`] that records committed batches
///
/// `fail_next(n)` makes the next `n` commits fail with a transient error,
/// which is how retry paths are exercised without a real database.
#[derive(Clone, Default)]
pub struct ScriptedStore {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Default)]
struct ScriptedInner {
    failures_left: u32,
    attempts: u32,
    committed: Vec<PersistItem>,
    offsets: Vec<(String, u64)>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, commits: u32) {
        self.inner.lock().failures_left = commits;
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn committed(&self) -> Vec<PersistItem> {
        self.inner.lock().committed.clone()
    }

    pub fn committed_offsets(&self) -> Vec<(String, u64)> {
        self.inner.lock().offsets.clone()
    }
}

impl EventStore for ScriptedStore {
    fn commit_batch(
        &mut self,
        items: &[PersistItem],
        offset: Option<(&str, u64)>,
    ) -> Result<BatchOutcome, StorageError> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(StorageError::Unavailable("scripted failure".into()));
        }

        let mut outcome = BatchOutcome::default();
        for item in items {
            if let PersistItem::DeadLetter { record, .. } = item {
                inner.dead_letters.push(record.clone());
                outcome.dead_lettered += 1;
            } else {
                outcome.inserted += 1;
            }
            inner.committed.push(item.clone());
        }
        if let Some((stream, offset)) = offset {
            inner.offsets.push((stream.to_string(), offset));
        }
        Ok(outcome)
    }

    fn committed_offset(&self, stream: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .inner
            .lock()
            .offsets
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, o)| *o)
            .max())
    }
}

impl DeadLetterStore for ScriptedStore {
    type Error = StorageError;

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, Self::Error> {
        Ok(self
            .inner
            .lock()
            .dead_letters
            .iter()
            .filter(|r| !r.acknowledged)
            .take(limit)
            .cloned()
            .collect())
    }

    fn dead_letter(&self, id: i64) -> Result<Option<DeadLetterRecord>, Self::Error> {
        Ok(self
            .inner
            .lock()
            .dead_letters
            .iter()
            .find(|r| r.id == Some(id))
            .cloned())
    }

    fn acknowledge(&mut self, id: i64) -> Result<bool, Self::Error> {
        let mut inner = self.inner.lock();
        match inner.dead_letters.iter_mut().find(|r| r.id == Some(id)) {
            Some(record) => {
                record.acknowledged = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
