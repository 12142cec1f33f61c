//! Dead-letter records
//!
//! An envelope that fails validation is kept verbatim together with the
//! reason and the time it was first seen. Operators can inspect, replay or
//! acknowledge records through a [`DeadLetterStore`].

use super::validator::ValidationError;
use crate::events::{canonical_json, EventType, DLQ_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Subject used when the envelope does not name a known event type
const UNKNOWN_SUBJECT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Store-assigned id, `None` until persisted
    pub id: Option<i64>,
    /// Hash of the canonical envelope; the same bad envelope dedups to one record
    pub fingerprint: String,
    /// Dead-letter subject, e.g. `dlq.market.quote_updates`
    pub subject: String,
    pub error_reason: String,
    pub error_detail: String,
    pub first_seen_ts: i64,
    pub envelope: Value,
    pub acknowledged: bool,
}

impl DeadLetterRecord {
    pub fn from_validation(envelope: Value, error: &ValidationError, first_seen_ts: i64) -> Self {
        Self::new(envelope, error.reason(), error.to_string(), first_seen_ts)
    }

    pub fn new(
        envelope: Value,
        error_reason: &str,
        error_detail: impl Into<String>,
        first_seen_ts: i64,
    ) -> Self {
        let subject = envelope
            .get("event_type")
            .and_then(Value::as_str)
            .and_then(EventType::parse)
            .map(|t| t.dead_letter_subject())
            .unwrap_or_else(|| format!("{DLQ_PREFIX}{UNKNOWN_SUBJECT}"));

        Self {
            id: None,
            fingerprint: fingerprint(&envelope),
            subject,
            error_reason: error_reason.to_string(),
            error_detail: error_detail.into(),
            first_seen_ts,
            envelope,
            acknowledged: false,
        }
    }
}

/// Hex SHA-256 of the canonical envelope
pub fn fingerprint(envelope: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(envelope).as_bytes()))
}

/// Operator access to persisted dead-letter records
pub trait DeadLetterStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Unacknowledged records, oldest first
    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, Self::Error>;

    fn dead_letter(&self, id: i64) -> Result<Option<DeadLetterRecord>, Self::Error>;

    /// Returns false when no record has that id
    fn acknowledge(&mut self, id: i64) -> Result<bool, Self::Error>;
}
