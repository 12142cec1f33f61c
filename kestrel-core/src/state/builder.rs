//! State Builder - single owner of the market projection
//!
//! ## Apply Rules
//!
//! ```text
//!   incoming (ts, key) vs current stamp of the field group
//!   ────────────────────────────────────────────────────────
//!   ts <  current.ts                  → Stale      (no change)
//!   ts >  current.ts                  → Applied
//!   ts == current.ts, key >  current  → Applied    (tie-break)
//!   ts == current.ts, key == current  → Duplicate  (no change)
//!   ts == current.ts, key <  current  → Stale      (no change)
//! ```
//!
//! Field groups: spot (per product), quote, lifecycle, contract (per market).
//! Because every group only moves forward, a market's projection timestamp
//! never decreases whatever the delivery interleaving, and re-applying an
//! event is a no-op.
//!
//! The builder is the only writer. Everyone else reads through
//! [`SnapshotReader`].

use super::checkpoint::Checkpoint;
use super::projection::{
    ContractState, LifecycleState, MarketProjection, Projection, QuoteState, SpotPoint, SpotState,
};
use super::snapshot::{SnapshotReader, TradableMarketState};
use super::stamp::{ApplyOutcome, FieldStamp};
use crate::config::IngestConfig;
use crate::data::TwoSidedQuote;
use crate::events::{
    ContractUpdate, EventPayload, MarketEvent, MarketLifecycle, QuoteUpdate, SpotTick,
};
use crate::monitoring::StateMetrics;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

pub struct StateBuilder {
    config: IngestConfig,
    shared: Arc<RwLock<Projection>>,
    metrics: Option<StateMetrics>,
    last_offset: Option<u64>,
    events_seen: u64,
}

impl StateBuilder {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            shared: Arc::new(RwLock::new(Projection::default())),
            metrics: None,
            last_offset: None,
            events_seen: 0,
        }
    }

    /// Rebuild from a checkpoint; replay resumes after its offset
    pub fn from_checkpoint(config: IngestConfig, checkpoint: Checkpoint) -> Self {
        let last_offset = checkpoint.last_offset;
        let projection = checkpoint.into_projection();
        Self {
            config,
            shared: Arc::new(RwLock::new(projection)),
            metrics: None,
            last_offset,
            events_seen: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: StateMetrics) -> Self {
        metrics.markets.set(self.shared.read().markets.len() as i64);
        self.metrics = Some(metrics);
        self
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(Arc::clone(&self.shared))
    }

    pub fn get_snapshot(&self, market_id: &str, now: i64) -> Option<TradableMarketState> {
        self.reader().get_snapshot(market_id, now)
    }

    pub fn projection_ts(&self, market_id: &str) -> Option<i64> {
        self.reader().projection_ts(market_id)
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    pub fn market_count(&self) -> usize {
        self.shared.read().markets.len()
    }

    /// Apply an event consumed at a stream offset
    pub fn apply_at(&mut self, event: &MarketEvent, offset: u64) -> ApplyOutcome {
        let outcome = self.apply_event(event);
        self.last_offset = Some(self.last_offset.map_or(offset, |last| last.max(offset)));
        outcome
    }

    pub fn apply_event(&mut self, event: &MarketEvent) -> ApplyOutcome {
        self.events_seen += 1;
        let key = event.idempotency_key.as_str();

        let outcome = {
            let mut projection = self.shared.write();
            match &event.payload {
                EventPayload::SpotTick(tick) => apply_spot(&mut projection, &self.config, tick, key),
                EventPayload::QuoteUpdate(quote) => {
                    apply_quote(&mut projection, &self.config, quote, key)
                }
                EventPayload::MarketLifecycle(lifecycle) => {
                    apply_lifecycle(&mut projection, &self.config, lifecycle, event.ts_event, key)
                }
                EventPayload::ContractUpdate(contract) => {
                    apply_contract(&mut projection, &self.config, contract, event.ts_event, key)
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            let event_type = event.event_type.as_str();
            match outcome {
                ApplyOutcome::Applied => {
                    metrics.applied_total.with_label_values(&[event_type]).inc();
                    metrics.markets.set(self.shared.read().markets.len() as i64);
                }
                other => metrics
                    .discarded_total
                    .with_label_values(&[event_type, other.as_str()])
                    .inc(),
            }
        }

        if !outcome.is_applied() {
            debug!(
                event_type = %event.event_type,
                entity = %event.entity_id(),
                ts = event.domain_ts(),
                outcome = outcome.as_str(),
                "event discarded"
            );
        }

        outcome
    }

    /// Serialize the projection for recovery
    pub fn checkpoint(&self, created_ts: i64) -> Checkpoint {
        Checkpoint::capture(&self.shared.read(), self.last_offset, created_ts)
    }
}

fn market_mut<'a>(
    projection: &'a mut Projection,
    config: &IngestConfig,
    market_id: &str,
) -> &'a mut MarketProjection {
    let entry = projection
        .markets
        .entry(market_id.to_string())
        .or_insert_with(|| {
            Arc::new(MarketProjection::new(market_id, config.product_for(market_id)))
        });
    // copy-on-write: readers holding the old Arc keep their snapshot
    Arc::make_mut(entry)
}

fn current_stamp<'a, T: 'a>(
    projection: &'a Projection,
    market_id: &str,
    field: impl Fn(&'a MarketProjection) -> Option<&'a T>,
    stamp: impl Fn(&'a T) -> &'a FieldStamp,
) -> Option<&'a FieldStamp> {
    projection
        .markets
        .get(market_id)
        .and_then(|m| field(m.as_ref()))
        .map(stamp)
}

fn apply_spot(
    projection: &mut Projection,
    config: &IngestConfig,
    tick: &SpotTick,
    key: &str,
) -> ApplyOutcome {
    let outcome = FieldStamp::admit(
        projection.spots.get(&tick.product_id).map(|s| &s.stamp),
        tick.ts,
        key,
    );
    if !outcome.is_applied() {
        return outcome;
    }

    projection.spots.insert(
        tick.product_id.clone(),
        SpotState {
            price: tick.price,
            sequence_num: tick.sequence_num,
            stamp: FieldStamp::new(tick.ts, key),
        },
    );

    let history = projection
        .spot_history
        .entry(tick.product_id.clone())
        .or_insert_with(VecDeque::new);
    match history.back_mut() {
        // tie-break winner at the same second replaces the point
        Some(last) if last.ts == tick.ts => last.price = tick.price,
        _ => history.push_back(SpotPoint {
            ts: tick.ts,
            price: tick.price,
        }),
    }
    let oldest_kept = tick.ts - config.spot_history_retention_s;
    while history.len() > config.spot_history_max_points
        || history.front().map_or(false, |p| p.ts < oldest_kept)
    {
        history.pop_front();
    }

    outcome
}

fn apply_quote(
    projection: &mut Projection,
    config: &IngestConfig,
    quote: &QuoteUpdate,
    key: &str,
) -> ApplyOutcome {
    let current = current_stamp(projection, &quote.market_id, |m| m.quote.as_ref(), |q| &q.stamp);
    let outcome = FieldStamp::admit(current, quote.ts, key);
    if outcome.is_applied() {
        market_mut(projection, config, &quote.market_id).quote = Some(QuoteState {
            quote: TwoSidedQuote::new(quote.yes_bid, quote.no_bid),
            stamp: FieldStamp::new(quote.ts, key),
        });
    }
    outcome
}

fn apply_lifecycle(
    projection: &mut Projection,
    config: &IngestConfig,
    lifecycle: &MarketLifecycle,
    ts: i64,
    key: &str,
) -> ApplyOutcome {
    let current = current_stamp(
        projection,
        &lifecycle.market_id,
        |m| m.lifecycle.as_ref(),
        |l| &l.stamp,
    );
    let outcome = FieldStamp::admit(current, ts, key);
    if outcome.is_applied() {
        market_mut(projection, config, &lifecycle.market_id).lifecycle = Some(LifecycleState {
            status: lifecycle.status.clone(),
            close_ts: lifecycle.close_ts,
            expected_expiration_ts: lifecycle.expected_expiration_ts,
            expiration_ts: lifecycle.expiration_ts,
            settlement_ts: lifecycle.settlement_ts,
            stamp: FieldStamp::new(ts, key),
        });
    }
    outcome
}

fn apply_contract(
    projection: &mut Projection,
    config: &IngestConfig,
    contract: &ContractUpdate,
    ts: i64,
    key: &str,
) -> ApplyOutcome {
    let current = current_stamp(
        projection,
        &contract.ticker,
        |m| m.contract.as_ref(),
        |c| &c.stamp,
    );
    let outcome = FieldStamp::admit(current, ts, key);
    if outcome.is_applied() {
        market_mut(projection, config, &contract.ticker).contract = Some(ContractState {
            shape: contract.shape,
            close_ts: contract.close_ts,
            expected_expiration_ts: contract.expected_expiration_ts,
            expiration_ts: contract.expiration_ts,
            settled_ts: contract.settled_ts,
            outcome: contract.outcome.clone(),
            stamp: FieldStamp::new(ts, key),
        });
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EnvelopeValidator;
    use crate::events::ContractShape;
    use crate::testing::{
        contract_envelope, lifecycle_envelope, quote_envelope, spot_tick_envelope, validated,
    };

    fn builder() -> StateBuilder {
        StateBuilder::new(IngestConfig::default())
    }

    #[test]
    fn test_quote_applies_and_derives_asks() {
        let mut builder = builder();
        let event = validated(quote_envelope("M1", 1_000, Some(40), Some(55), Some("a")));
        assert_eq!(builder.apply_event(&event), ApplyOutcome::Applied);

        let snapshot = builder.get_snapshot("M1", 1_010).unwrap();
        let quote = snapshot.quote.unwrap();
        assert_eq!(quote.quote.yes_ask(), Some(1.0 - 0.55));
        assert_eq!(quote.quote.no_ask(), Some(1.0 - 0.40));
        assert_eq!(quote.age_s, 10.0);
        assert_eq!(snapshot.projection_ts, Some(1_000));
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut builder = builder();
        let event = validated(quote_envelope("M1", 1_000, Some(40), Some(55), Some("a")));
        builder.apply_event(&event);
        let before = builder.get_snapshot("M1", 1_000);

        assert_eq!(builder.apply_event(&event), ApplyOutcome::Duplicate);
        assert_eq!(builder.get_snapshot("M1", 1_000), before);
    }

    #[test]
    fn test_older_quote_discarded() {
        let mut builder = builder();
        builder.apply_event(&validated(quote_envelope("M1", 1_000, Some(40), Some(55), Some("a"))));
        let outcome =
            builder.apply_event(&validated(quote_envelope("M1", 999, Some(10), Some(10), Some("b"))));

        assert_eq!(outcome, ApplyOutcome::Stale);
        let quote = builder.get_snapshot("M1", 1_000).unwrap().quote.unwrap();
        assert_eq!(quote.quote.yes_bid, Some(0.40));
    }

    #[test]
    fn test_equal_ts_greater_key_wins() {
        let mut builder = builder();
        let a = validated(quote_envelope("M1", 1_000, Some(40), Some(55), Some("a")));
        let b = validated(quote_envelope("M1", 1_000, Some(41), Some(54), Some("b")));
        let (low, high) = if a.idempotency_key < b.idempotency_key { (a, b) } else { (b, a) };

        // delivery order does not matter
        builder.apply_event(&high);
        assert_eq!(builder.apply_event(&low), ApplyOutcome::Stale);

        let mut other = StateBuilder::new(IngestConfig::default());
        other.apply_event(&low);
        assert_eq!(other.apply_event(&high), ApplyOutcome::Applied);

        assert_eq!(
            builder.get_snapshot("M1", 1_000).unwrap().quote,
            other.get_snapshot("M1", 1_000).unwrap().quote
        );
    }

    #[test]
    fn test_field_groups_are_independent() {
        let mut builder = builder();
        builder.apply_event(&validated(quote_envelope("M1", 2_000, Some(40), Some(55), Some("q"))));
        // an older lifecycle still lands: it is a different field group
        let outcome = builder.apply_event(&validated(lifecycle_envelope(
            "M1",
            1_000,
            "active",
            Some(5_000),
        )));
        assert_eq!(outcome, ApplyOutcome::Applied);

        let snapshot = builder.get_snapshot("M1", 2_000).unwrap();
        assert_eq!(snapshot.projection_ts, Some(2_000));
        assert_eq!(snapshot.settlement_ts(), Some(5_000));
        assert!(snapshot.status.unwrap().is_open());
    }

    #[test]
    fn test_spot_joined_into_market_snapshot() {
        let mut builder = builder();
        builder.apply_event(&validated(spot_tick_envelope("BTC-USD", 1_000, 60_000.0, Some(1))));
        builder.apply_event(&validated(contract_envelope(
            "M1",
            1_000,
            "less",
            None,
            Some(61_000.0),
            Some(4_600),
        )));

        let snapshot = builder.get_snapshot("M1", 1_005).unwrap();
        let spot = snapshot.spot.unwrap();
        assert_eq!(spot.price, 60_000.0);
        assert_eq!(spot.age_s, 5.0);
        assert_eq!(snapshot.shape(), Some(ContractShape::Less { upper: 61_000.0 }));
    }

    #[test]
    fn test_spot_history_bounded_and_ordered() {
        let config = IngestConfig {
            spot_history_max_points: 3,
            ..IngestConfig::default()
        };
        let mut builder = StateBuilder::new(config);
        for (i, ts) in [10, 20, 15, 30, 40].into_iter().enumerate() {
            builder.apply_event(&validated(spot_tick_envelope(
                "BTC-USD",
                ts,
                60_000.0 + i as f64,
                Some(i as u64),
            )));
        }

        let history = builder.reader().spot_history("BTC-USD", 0);
        let timestamps: Vec<i64> = history.iter().map(|p| p.ts).collect();
        assert_eq!(timestamps, vec![20, 30, 40]);
    }

    #[test]
    fn test_apply_at_tracks_highest_offset() {
        let mut builder = builder();
        let event = validated(spot_tick_envelope("BTC-USD", 1_000, 60_000.0, Some(1)));
        builder.apply_at(&event, 7);
        builder.apply_at(&event, 3);
        assert_eq!(builder.last_offset(), Some(7));
    }

    #[test]
    fn test_reader_sees_updates() {
        let mut builder = builder();
        let reader = builder.reader();
        assert!(reader.get_snapshot("M1", 0).is_none());
        builder.apply_event(&validated(quote_envelope("M1", 1_000, Some(40), Some(55), None)));
        assert!(reader.get_snapshot("M1", 1_000).is_some());
        assert_eq!(reader.market_ids(), vec!["M1".to_string()]);
    }

    #[test]
    fn test_invalid_envelope_never_reaches_builder() {
        let validator = EnvelopeValidator::new();
        let crossed = quote_envelope("M1", 1_000, Some(70), Some(40), None);
        assert!(validator.validate(&crossed).is_err());
    }
}
