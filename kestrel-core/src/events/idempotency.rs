//! Idempotency key derivation
//!
//! Keys have the form `{event_type}:v{schema_version}:{digest}` where
//! `digest` is the first 24 hex characters of a SHA-256 over the identity
//! material. Identity material is, in order of preference:
//!
//! 1. the upstream key carried on the envelope, used verbatim
//! 2. a stable upstream identity tuple (e.g. product + ts + sequence number)
//! 3. `event_type|schema_version|source|canonical_json(payload)`
//!
//! Ingestion-local fields never enter the material. When none of the three
//! yields a stable identity the event fails closed.

use super::canonical::canonical_json;
use super::envelope::EventType;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex characters of the digest kept in the key
const DIGEST_HEX_LEN: usize = 24;

/// Payload fields stamped by the local process, stripped before hashing
pub const INGEST_LOCAL_FIELDS: [&str; 3] = ["received_ts", "ingested_at", "local_ts"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    #[error("payload is not a JSON object")]
    PayloadNotObject,
    #[error("payload has no identifying content")]
    EmptyPayload,
    #[error("source is empty")]
    EmptySource,
}

/// Use the upstream key when present, otherwise derive one
pub fn resolve_key(
    upstream: Option<&str>,
    event_type: EventType,
    schema_version: u32,
    source: &str,
    payload: &Value,
) -> Result<String, IdempotencyError> {
    match upstream.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => derive_key(event_type, schema_version, source, payload),
    }
}

/// Derive a deterministic key for an event
pub fn derive_key(
    event_type: EventType,
    schema_version: u32,
    source: &str,
    payload: &Value,
) -> Result<String, IdempotencyError> {
    let map = payload.as_object().ok_or(IdempotencyError::PayloadNotObject)?;

    let material = match identity_tuple(event_type, map) {
        Some(parts) => format!("{}|{}", event_type.as_str(), parts.join("|")),
        None => {
            if source.trim().is_empty() {
                return Err(IdempotencyError::EmptySource);
            }
            let stripped = strip_local_fields(map);
            if stripped.is_empty() {
                return Err(IdempotencyError::EmptyPayload);
            }
            format!(
                "{}|{}|{}|{}",
                event_type.as_str(),
                schema_version,
                source,
                canonical_json(&Value::Object(stripped))
            )
        }
    };

    Ok(format_key(event_type, schema_version, &material))
}

fn format_key(event_type: EventType, schema_version: u32, material: &str) -> String {
    let digest = hex::encode(Sha256::digest(material.as_bytes()));
    format!(
        "{}:v{}:{}",
        event_type.as_str(),
        schema_version,
        &digest[..DIGEST_HEX_LEN]
    )
}

/// Stable upstream identity fields per event type
///
/// Every listed field must be present and non-null, otherwise there is no
/// tuple and derivation falls back to the canonical payload.
fn identity_tuple(event_type: EventType, payload: &Map<String, Value>) -> Option<Vec<String>> {
    let fields: &[&str] = match event_type {
        EventType::SpotTick => &["product_id", "ts", "sequence_num"],
        EventType::QuoteUpdate => &["market_id", "ts", "source_msg_id"],
        EventType::EdgeSnapshot => &["asof_ts", "market_id", "strategy_version"],
        EventType::OpportunityDecision => &["ts_eval", "market_id", "side", "strategy_version"],
        EventType::MarketLifecycle | EventType::ContractUpdate => return None,
    };

    fields
        .iter()
        .map(|field| match payload.get(*field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(canonical_json(other)),
        })
        .collect()
}

fn strip_local_fields(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(k, _)| !INGEST_LOCAL_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
