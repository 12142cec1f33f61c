//! Event catalogue and the validated event envelope

use super::payloads::{ContractUpdate, MarketLifecycle, QuoteUpdate, SpotTick};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix prepended to a subject to form its dead-letter subject
pub const DLQ_PREFIX: &str = "dlq.";

/// Every event type the pipeline knows about
///
/// The first four are inbound market events. Edge snapshots and opportunity
/// decisions are produced by the pipeline itself and share the same
/// identity scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SpotTick,
    QuoteUpdate,
    MarketLifecycle,
    ContractUpdate,
    EdgeSnapshot,
    OpportunityDecision,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::SpotTick,
        EventType::QuoteUpdate,
        EventType::MarketLifecycle,
        EventType::ContractUpdate,
        EventType::EdgeSnapshot,
        EventType::OpportunityDecision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SpotTick => "spot_tick",
            EventType::QuoteUpdate => "quote_update",
            EventType::MarketLifecycle => "market_lifecycle",
            EventType::ContractUpdate => "contract_update",
            EventType::EdgeSnapshot => "edge_snapshot",
            EventType::OpportunityDecision => "opportunity_decision",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Log subject the event type is published on
    pub fn subject(&self) -> &'static str {
        match self {
            EventType::SpotTick => "market.spot_ticks",
            EventType::QuoteUpdate => "market.quote_updates",
            EventType::MarketLifecycle => "market.lifecycle",
            EventType::ContractUpdate => "market.contract_updates",
            EventType::EdgeSnapshot => "strategy.edge_snapshots",
            EventType::OpportunityDecision => "strategy.opportunity_decisions",
        }
    }

    pub fn dead_letter_subject(&self) -> String {
        format!("{DLQ_PREFIX}{}", self.subject())
    }

    pub fn supported_schema_versions(&self) -> &'static [u32] {
        &[1]
    }

    pub fn current_schema_version(&self) -> u32 {
        1
    }

    /// Whether the event type is accepted on the inbound market path
    pub fn is_market_event(&self) -> bool {
        matches!(
            self,
            EventType::SpotTick
                | EventType::QuoteUpdate
                | EventType::MarketLifecycle
                | EventType::ContractUpdate
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of a validated market event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    SpotTick(SpotTick),
    QuoteUpdate(QuoteUpdate),
    MarketLifecycle(MarketLifecycle),
    ContractUpdate(ContractUpdate),
}

/// A validated market event
///
/// Immutable once created. `raw_payload` is the payload exactly as it
/// arrived, kept for the append-only raw event table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_type: EventType,
    pub schema_version: u32,
    pub ts_event: i64,
    pub ts_produced: i64,
    pub source: String,
    pub idempotency_key: String,
    pub payload: EventPayload,
    pub raw_payload: serde_json::Value,
}

impl MarketEvent {
    /// Timestamp that orders this event against others for the same entity
    pub fn domain_ts(&self) -> i64 {
        match &self.payload {
            EventPayload::SpotTick(tick) => tick.ts,
            EventPayload::QuoteUpdate(quote) => quote.ts,
            EventPayload::MarketLifecycle(_) | EventPayload::ContractUpdate(_) => self.ts_event,
        }
    }

    /// Natural key of the entity this event updates
    pub fn entity_id(&self) -> &str {
        match &self.payload {
            EventPayload::SpotTick(tick) => &tick.product_id,
            EventPayload::QuoteUpdate(quote) => &quote.market_id,
            EventPayload::MarketLifecycle(lifecycle) => &lifecycle.market_id,
            EventPayload::ContractUpdate(contract) => &contract.ticker,
        }
    }

    pub fn subject(&self) -> &'static str {
        self.event_type.subject()
    }

    /// Re-assemble the wire envelope
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "event_type": self.event_type.as_str(),
            "schema_version": self.schema_version,
            "ts_event": self.ts_event,
            "ts_produced": self.ts_produced,
            "source": self.source,
            "idempotency_key": self.idempotency_key,
            "payload": self.raw_payload,
        })
    }
}
