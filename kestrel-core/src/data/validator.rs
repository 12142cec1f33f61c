//! Centralized envelope validation
//!
//! Single validation point for every inbound envelope. Checks, in order:
//! 1. the envelope is a JSON object with only known fields
//! 2. `event_type` is a known inbound market event
//! 3. `schema_version` is supported for that type
//! 4. required envelope fields are present and well typed
//! 5. the payload parses strictly into the typed payload
//! 6. a stable idempotency key exists
//!
//! Any failure is terminal for that envelope: it goes to dead-letter and is
//! never retried in place.

use crate::events::payloads::{
    ContractUpdateWire, MarketLifecycleWire, QuoteUpdateWire, SpotTickWire,
};
use crate::events::{resolve_key, EventPayload, EventType, MarketEvent};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Envelope fields accepted on the wire
const ENVELOPE_FIELDS: [&str; 7] = [
    "event_type",
    "schema_version",
    "ts_event",
    "ts_produced",
    "source",
    "idempotency_key",
    "payload",
];

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MalformedEnvelope(String),
    UnknownEventType(String),
    UnsupportedSchemaVersion {
        event_type: String,
        version: u64,
    },
    MissingField(String),
    InvalidField {
        field: String,
        detail: String,
    },
    UnknownField(String),
    CrossedQuote {
        yes_bid: u32,
        no_bid: u32,
    },
    UnstableIdentity(String),
}

impl ValidationError {
    pub fn invalid(field: &str, detail: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.to_string(),
            detail: detail.into(),
        }
    }

    /// Stable label stored as the dead-letter `error_reason`
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::MalformedEnvelope(_) => "malformed_envelope",
            ValidationError::UnknownEventType(_) => "unknown_event_type",
            ValidationError::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidField { .. } => "invalid_field",
            ValidationError::UnknownField(_) => "unknown_field",
            ValidationError::CrossedQuote { .. } => "crossed_quote",
            ValidationError::UnstableIdentity(_) => "unstable_identity",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MalformedEnvelope(detail) => {
                write!(f, "Malformed envelope: {}", detail)
            }
            ValidationError::UnknownEventType(event_type) => {
                write!(f, "Unknown event type '{}'", event_type)
            }
            ValidationError::UnsupportedSchemaVersion {
                event_type,
                version,
            } => {
                write!(
                    f,
                    "Unsupported schema version {} for {}",
                    version, event_type
                )
            }
            ValidationError::MissingField(field) => {
                write!(f, "Missing required field '{}'", field)
            }
            ValidationError::InvalidField { field, detail } => {
                write!(f, "Invalid field '{}': {}", field, detail)
            }
            ValidationError::UnknownField(field) => write!(f, "Unknown field '{}'", field),
            ValidationError::CrossedQuote { yes_bid, no_bid } => {
                write!(
                    f,
                    "Crossed quote: yes_bid={} + no_bid={} > 100",
                    yes_bid, no_bid
                )
            }
            ValidationError::UnstableIdentity(detail) => {
                write!(f, "No stable idempotency key: {}", detail)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Strict validator for inbound market envelopes
#[derive(Debug, Clone)]
pub struct EnvelopeValidator {
    supported_versions: BTreeMap<EventType, Vec<u32>>,
}

impl Default for EnvelopeValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeValidator {
    pub fn new() -> Self {
        let supported_versions = EventType::ALL
            .into_iter()
            .filter(EventType::is_market_event)
            .map(|t| (t, t.supported_schema_versions().to_vec()))
            .collect();
        Self { supported_versions }
    }

    /// Override the accepted schema versions of one event type
    pub fn with_supported_versions(mut self, event_type: EventType, versions: &[u32]) -> Self {
        self.supported_versions.insert(event_type, versions.to_vec());
        self
    }

    pub fn validate(&self, raw: &Value) -> Result<MarketEvent, ValidationError> {
        let envelope = raw
            .as_object()
            .ok_or_else(|| ValidationError::MalformedEnvelope("envelope is not a JSON object".into()))?;

        if let Some(unknown) = envelope
            .keys()
            .find(|k| !ENVELOPE_FIELDS.contains(&k.as_str()))
        {
            return Err(ValidationError::UnknownField(unknown.clone()));
        }

        let event_type_raw = required_str(envelope, "event_type")?;
        let event_type = EventType::parse(event_type_raw)
            .filter(EventType::is_market_event)
            .ok_or_else(|| ValidationError::UnknownEventType(event_type_raw.to_string()))?;

        let version = required(envelope, "schema_version")?
            .as_u64()
            .ok_or_else(|| ValidationError::invalid("schema_version", "must be a non-negative integer"))?;
        let supported = self
            .supported_versions
            .get(&event_type)
            .map(|versions| versions.iter().any(|v| u64::from(*v) == version))
            .unwrap_or(false);
        if !supported {
            return Err(ValidationError::UnsupportedSchemaVersion {
                event_type: event_type.as_str().to_string(),
                version,
            });
        }
        let schema_version = version as u32;

        let ts_event = required_ts(envelope, "ts_event")?;
        let ts_produced = required_ts(envelope, "ts_produced")?;

        let source = required_str(envelope, "source")?;
        if source.trim().is_empty() {
            return Err(ValidationError::invalid("source", "must not be empty"));
        }

        let upstream_key = match envelope.get("idempotency_key") {
            None | Some(Value::Null) => None,
            Some(Value::String(key)) => Some(key.as_str()),
            Some(_) => return Err(ValidationError::invalid("idempotency_key", "must be a string")),
        };

        let raw_payload = required(envelope, "payload")?;
        if !raw_payload.is_object() {
            return Err(ValidationError::invalid("payload", "must be a JSON object"));
        }

        let payload = match event_type {
            EventType::SpotTick => {
                EventPayload::SpotTick(parse_payload::<SpotTickWire>(raw_payload)?.try_into()?)
            }
            EventType::QuoteUpdate => {
                EventPayload::QuoteUpdate(parse_payload::<QuoteUpdateWire>(raw_payload)?.try_into()?)
            }
            EventType::MarketLifecycle => EventPayload::MarketLifecycle(
                parse_payload::<MarketLifecycleWire>(raw_payload)?.try_into()?,
            ),
            EventType::ContractUpdate => EventPayload::ContractUpdate(
                parse_payload::<ContractUpdateWire>(raw_payload)?.try_into()?,
            ),
            EventType::EdgeSnapshot | EventType::OpportunityDecision => {
                return Err(ValidationError::UnknownEventType(event_type.as_str().to_string()));
            }
        };

        let idempotency_key = resolve_key(upstream_key, event_type, schema_version, source, raw_payload)
            .map_err(|e| ValidationError::UnstableIdentity(e.to_string()))?;

        Ok(MarketEvent {
            event_type,
            schema_version,
            ts_event,
            ts_produced,
            source: source.to_string(),
            idempotency_key,
            payload,
            raw_payload: raw_payload.clone(),
        })
    }
}

fn required<'a>(envelope: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ValidationError> {
    match envelope.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(value) => Ok(value),
    }
}

fn required_str<'a>(envelope: &'a Map<String, Value>, field: &str) -> Result<&'a str, ValidationError> {
    required(envelope, field)?
        .as_str()
        .ok_or_else(|| ValidationError::invalid(field, "must be a string"))
}

fn required_ts(envelope: &Map<String, Value>, field: &str) -> Result<i64, ValidationError> {
    let ts = required(envelope, field)?
        .as_i64()
        .ok_or_else(|| ValidationError::invalid(field, "must be an integer unix timestamp"))?;
    if ts <= 0 {
        return Err(ValidationError::invalid(field, format!("timestamp must be positive, got {ts}")));
    }
    Ok(ts)
}

fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload.clone()).map_err(|e| classify_serde_error(&e.to_string()))
}

/// Map serde's messages onto the closed validation taxonomy
fn classify_serde_error(message: &str) -> ValidationError {
    let quoted = message
        .split('`')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_default();

    if message.starts_with("missing field") {
        ValidationError::MissingField(quoted)
    } else if message.starts_with("unknown field") {
        ValidationError::UnknownField(quoted)
    } else {
        ValidationError::invalid("payload", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lifecycle_envelope, quote_envelope, spot_tick_envelope};
    use serde_json::json;

    fn validator() -> EnvelopeValidator {
        EnvelopeValidator::new()
    }

    #[test]
    fn test_valid_spot_tick() {
        let event = validator()
            .validate(&spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, Some(1)))
            .unwrap();
        assert_eq!(event.event_type, EventType::SpotTick);
        assert_eq!(event.domain_ts(), 1_700_000_000);
        assert_eq!(event.entity_id(), "BTC-USD");
        assert!(event.idempotency_key.starts_with("spot_tick:v1:"));
    }

    #[test]
    fn test_not_an_object() {
        let err = validator().validate(&json!("hello")).unwrap_err();
        assert_eq!(err.reason(), "malformed_envelope");
    }

    #[test]
    fn test_unknown_event_type() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["event_type"] = json!("order_fill");
        assert_eq!(validator().validate(&envelope).unwrap_err().reason(), "unknown_event_type");
    }

    #[test]
    fn test_internal_event_types_rejected_inbound() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["event_type"] = json!("edge_snapshot");
        assert_eq!(validator().validate(&envelope).unwrap_err().reason(), "unknown_event_type");
    }

    #[test]
    fn test_unsupported_schema_version() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["schema_version"] = json!(2);
        let err = validator().validate(&envelope).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnsupportedSchemaVersion {
                event_type: "spot_tick".into(),
                version: 2
            }
        );

        let widened = validator().with_supported_versions(EventType::SpotTick, &[1, 2]);
        assert!(widened.validate(&envelope).is_ok());
    }

    #[test]
    fn test_missing_envelope_field() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope.as_object_mut().unwrap().remove("ts_produced");
        assert_eq!(
            validator().validate(&envelope).unwrap_err(),
            ValidationError::MissingField("ts_produced".into())
        );
    }

    #[test]
    fn test_unknown_envelope_field() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["priority"] = json!("high");
        assert_eq!(
            validator().validate(&envelope).unwrap_err(),
            ValidationError::UnknownField("priority".into())
        );
    }

    #[test]
    fn test_missing_payload_field() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["payload"].as_object_mut().unwrap().remove("price");
        assert_eq!(
            validator().validate(&envelope).unwrap_err(),
            ValidationError::MissingField("price".into())
        );
    }

    #[test]
    fn test_unknown_payload_field() {
        let mut envelope = quote_envelope("M1", 1_700_000_000, Some(40), Some(55), None);
        envelope["payload"]["volume"] = json!(10);
        assert_eq!(
            validator().validate(&envelope).unwrap_err(),
            ValidationError::UnknownField("volume".into())
        );
    }

    #[test]
    fn test_wrong_type_is_invalid_field() {
        let mut envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, None);
        envelope["payload"]["price"] = json!("sixty thousand");
        assert_eq!(validator().validate(&envelope).unwrap_err().reason(), "invalid_field");
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let envelope = spot_tick_envelope("BTC-USD", 1_700_000_000, 0.0, None);
        assert_eq!(validator().validate(&envelope).unwrap_err().reason(), "invalid_field");
    }

    #[test]
    fn test_crossed_quote_rejected() {
        let envelope = quote_envelope("M1", 1_700_000_000, Some(60), Some(45), None);
        assert_eq!(validator().validate(&envelope).unwrap_err().reason(), "crossed_quote");
    }

    #[test]
    fn test_upstream_key_kept_verbatim() {
        let mut envelope = lifecycle_envelope("M1", 1_700_000_000, "active", Some(1_700_003_600));
        envelope["idempotency_key"] = json!("upstream-7");
        let event = validator().validate(&envelope).unwrap();
        assert_eq!(event.idempotency_key, "upstream-7");
    }

    #[test]
    fn test_same_input_same_key() {
        let envelope = lifecycle_envelope("M1", 1_700_000_000, "open", Some(1_700_003_600));
        let a = validator().validate(&envelope).unwrap();
        let b = validator().validate(&envelope).unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_classify_serde_messages() {
        assert_eq!(
            classify_serde_error("missing field `ts`"),
            ValidationError::MissingField("ts".into())
        );
        assert_eq!(
            classify_serde_error("unknown field `x`, expected one of `ts`, `price`"),
            ValidationError::UnknownField("x".into())
        );
    }
}
