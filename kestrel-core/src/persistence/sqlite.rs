//! SQLite store
//!
//! ## Write Rules
//!
//! ```text
//!   events_raw        INSERT ... ON CONFLICT DO NOTHING     (append-only, keyed)
//!   state_*_latest    upsert only if the raw row was new,
//!                     and only if (ts, key) moves forward
//!   edge_snapshots    INSERT ... ON CONFLICT DO NOTHING     (asof_ts, market, version)
//!   decisions         INSERT ... ON CONFLICT DO NOTHING     (ts_eval, market, side, version)
//!   dead_letters      INSERT ... ON CONFLICT DO NOTHING     (fingerprint; keeps first_seen_ts)
//!   consumer_offsets  upsert, never moves backwards
//! ```
//!
//! Every batch is one transaction. Replaying a committed batch changes
//! nothing.

use super::replay::ReplayStore;
use super::store::{BatchOutcome, EventStore, PersistItem, StorageError};
use crate::data::{DeadLetterRecord, DeadLetterStore, TwoSidedQuote};
use crate::events::{
    ContractUpdate, EventPayload, MarketEvent, MarketLifecycle, QuoteUpdate, SpotTick,
};
use crate::records::{EdgeSnapshot, OpportunityDecision};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events_raw (
    event_type      TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    ts_event        INTEGER NOT NULL,
    ts_produced     INTEGER NOT NULL,
    source          TEXT NOT NULL,
    schema_version  INTEGER NOT NULL,
    payload         TEXT NOT NULL,
    stream_offset   INTEGER,
    PRIMARY KEY (event_type, idempotency_key)
);

CREATE TABLE IF NOT EXISTS state_spot_latest (
    product_id      TEXT PRIMARY KEY,
    ts              INTEGER NOT NULL,
    price           REAL NOT NULL,
    sequence_num    INTEGER,
    idempotency_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state_quote_latest (
    market_id       TEXT PRIMARY KEY,
    ts              INTEGER NOT NULL,
    yes_bid         REAL,
    no_bid          REAL,
    yes_ask         REAL,
    no_ask          REAL,
    idempotency_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state_lifecycle_latest (
    market_id              TEXT PRIMARY KEY,
    ts                     INTEGER NOT NULL,
    status                 TEXT NOT NULL,
    close_ts               INTEGER,
    expected_expiration_ts INTEGER,
    expiration_ts          INTEGER,
    settlement_ts          INTEGER,
    idempotency_key        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state_contract_latest (
    ticker                 TEXT PRIMARY KEY,
    ts                     INTEGER NOT NULL,
    strike_type            TEXT,
    lower                  REAL,
    upper                  REAL,
    close_ts               INTEGER,
    expected_expiration_ts INTEGER,
    expiration_ts          INTEGER,
    settled_ts             INTEGER,
    outcome                TEXT,
    idempotency_key        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edge_snapshots (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    asof_ts          INTEGER NOT NULL,
    market_id        TEXT NOT NULL,
    product_id       TEXT NOT NULL,
    strategy_version TEXT NOT NULL,
    settlement_ts    INTEGER,
    horizon_s        INTEGER,
    spot             REAL,
    spot_ts          INTEGER,
    sigma            REAL,
    sigma_source     TEXT,
    sigma_reason     TEXT,
    prob_yes         REAL,
    yes_bid          REAL,
    yes_ask          REAL,
    no_bid           REAL,
    no_ask           REAL,
    quote_ts         INTEGER,
    p_market         REAL,
    ev_take_yes      REAL,
    ev_take_no       REAL,
    skip_reason      TEXT,
    UNIQUE (asof_ts, market_id, strategy_version)
);

CREATE TABLE IF NOT EXISTS opportunity_decisions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_eval          INTEGER NOT NULL,
    market_id        TEXT NOT NULL,
    strategy_version TEXT NOT NULL,
    side             TEXT NOT NULL,
    eligible         INTEGER NOT NULL,
    state            TEXT NOT NULL,
    reason           TEXT NOT NULL,
    ev_net           REAL,
    shadow           INTEGER NOT NULL,
    UNIQUE (ts_eval, market_id, side, strategy_version)
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint   TEXT NOT NULL UNIQUE,
    subject       TEXT NOT NULL,
    error_reason  TEXT NOT NULL,
    error_detail  TEXT NOT NULL,
    first_seen_ts INTEGER NOT NULL,
    envelope      TEXT NOT NULL,
    acknowledged  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS consumer_offsets (
    stream           TEXT PRIMARY KEY,
    committed_offset INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edge_snapshots_product ON edge_snapshots (product_id, asof_ts);
CREATE INDEX IF NOT EXISTS idx_dead_letters_open ON dead_letters (acknowledged, first_seen_ts);
";

/// Reason label for records that could not be encoded for storage
pub const ENCODE_ERROR_REASON: &str = "encode_error";

/// Monotonic guard shared by every latest-state upsert
macro_rules! forward_only {
    ($table:literal) => {
        concat!(
            " WHERE excluded.ts > ",
            $table,
            ".ts OR (excluded.ts = ",
            $table,
            ".ts AND excluded.idempotency_key > ",
            $table,
            ".idempotency_key)"
        )
    };
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn event_count(&self) -> Result<u64, StorageError> {
        self.count("SELECT COUNT(*) FROM events_raw")
    }

    pub fn edge_snapshot_count(&self) -> Result<u64, StorageError> {
        self.count("SELECT COUNT(*) FROM edge_snapshots")
    }

    pub fn decision_count(&self) -> Result<u64, StorageError> {
        self.count("SELECT COUNT(*) FROM opportunity_decisions")
    }

    fn count(&self, sql: &str) -> Result<u64, StorageError> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Latest persisted spot: `(ts, price, idempotency_key)`
    pub fn spot_latest(&self, product_id: &str) -> Result<Option<(i64, f64, String)>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT ts, price, idempotency_key FROM state_spot_latest WHERE product_id = ?1",
                params![product_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    /// Latest persisted quote: `(ts, yes_bid, no_bid)`
    pub fn quote_latest(
        &self,
        market_id: &str,
    ) -> Result<Option<(i64, Option<f64>, Option<f64>)>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT ts, yes_bid, no_bid FROM state_quote_latest WHERE market_id = ?1",
                params![market_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    /// Last accepted sigma per product, for seeding the volatility fallback
    pub fn latest_sigmas(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        // SQLite takes bare columns from the row that produced MAX()
        let mut stmt = self.conn.prepare(
            "SELECT product_id, sigma, MAX(asof_ts) FROM edge_snapshots
             WHERE sigma IS NOT NULL AND sigma_source IN ('ewma', 'history')
             GROUP BY product_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        let mut sigmas = BTreeMap::new();
        for row in rows {
            let (product, sigma) = row?;
            sigmas.insert(product, sigma);
        }
        Ok(sigmas)
    }
}

impl EventStore for SqliteStore {
    fn commit_batch(
        &mut self,
        items: &[PersistItem],
        offset: Option<(&str, u64)>,
    ) -> Result<BatchOutcome, StorageError> {
        let tx = self.conn.transaction()?;
        let outcome = write_items(&tx, items)?;

        if let Some((stream, committed)) = offset {
            tx.execute(
                "INSERT INTO consumer_offsets (stream, committed_offset) VALUES (?1, ?2)
                 ON CONFLICT(stream) DO UPDATE SET committed_offset = excluded.committed_offset
                 WHERE excluded.committed_offset > consumer_offsets.committed_offset",
                params![stream, to_i64(committed)],
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn committed_offset(&self, stream: &str) -> Result<Option<u64>, StorageError> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT committed_offset FROM consumer_offsets WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| o.max(0) as u64))
    }
}

impl ReplayStore for SqliteStore {
    fn commit_replayed(&mut self, event: MarketEvent, id: i64) -> Result<BatchOutcome, StorageError> {
        let tx = self.conn.transaction()?;
        let outcome = write_items(&tx, &[PersistItem::Event { event, offset: None }])?;
        tx.execute(
            "UPDATE dead_letters SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(outcome)
    }
}

impl DeadLetterStore for SqliteStore {
    type Error = StorageError;

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, Self::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fingerprint, subject, error_reason, error_detail, first_seen_ts, envelope, acknowledged
             FROM dead_letters WHERE acknowledged = 0
             ORDER BY first_seen_ts, id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], read_dead_letter)?;
        rows.map(|row| row?.decode()).collect()
    }

    fn dead_letter(&self, id: i64) -> Result<Option<DeadLetterRecord>, Self::Error> {
        self.conn
            .query_row(
                "SELECT id, fingerprint, subject, error_reason, error_detail, first_seen_ts, envelope, acknowledged
                 FROM dead_letters WHERE id = ?1",
                params![id],
                read_dead_letter,
            )
            .optional()?
            .map(RawDeadLetter::decode)
            .transpose()
    }

    fn acknowledge(&mut self, id: i64) -> Result<bool, Self::Error> {
        let changed = self.conn.execute(
            "UPDATE dead_letters SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }
}

struct RawDeadLetter {
    record: DeadLetterRecord,
    envelope: String,
}

impl RawDeadLetter {
    fn decode(mut self) -> Result<DeadLetterRecord, StorageError> {
        self.record.envelope = serde_json::from_str(&self.envelope)
            .map_err(|e| StorageError::Encode(format!("dead-letter envelope: {e}")))?;
        Ok(self.record)
    }
}

fn read_dead_letter(row: &Row<'_>) -> rusqlite::Result<RawDeadLetter> {
    Ok(RawDeadLetter {
        record: DeadLetterRecord {
            id: Some(row.get(0)?),
            fingerprint: row.get(1)?,
            subject: row.get(2)?,
            error_reason: row.get(3)?,
            error_detail: row.get(4)?,
            first_seen_ts: row.get(5)?,
            envelope: serde_json::Value::Null,
            acknowledged: row.get::<_, i64>(7)? != 0,
        },
        envelope: row.get(6)?,
    })
}

fn write_items(tx: &Transaction<'_>, items: &[PersistItem]) -> Result<BatchOutcome, StorageError> {
    let mut outcome = BatchOutcome::default();

    for item in items {
        let written = match item {
            PersistItem::Event { event, offset } => insert_event(tx, event, *offset),
            PersistItem::Edge(edge) => insert_edge(tx, edge),
            PersistItem::Decision(decision) => insert_decision(tx, decision),
            PersistItem::DeadLetter { record, .. } => {
                insert_dead_letter(tx, record)?;
                outcome.dead_lettered += 1;
                continue;
            }
        };

        match written {
            Ok(true) => outcome.inserted += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(StorageError::Encode(detail)) => {
                warn!(kind = item.kind(), %detail, "item diverted to dead-letter");
                insert_dead_letter(tx, &encode_dead_letter(item, &detail))?;
                outcome.dead_lettered += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn finite(field: &str, value: Option<f64>) -> Result<Option<f64>, StorageError> {
    match value {
        Some(v) if !v.is_finite() => Err(StorageError::Encode(format!("{field} is not finite"))),
        other => Ok(other),
    }
}

fn encode_dead_letter(item: &PersistItem, detail: &str) -> DeadLetterRecord {
    let (envelope, ts) = match item {
        PersistItem::Event { event, .. } => (event.to_envelope(), event.ts_event),
        PersistItem::Edge(edge) => (
            serde_json::json!({ "event_type": "edge_snapshot", "payload": edge }),
            edge.asof_ts,
        ),
        PersistItem::Decision(decision) => (
            serde_json::json!({ "event_type": "opportunity_decision", "payload": decision }),
            decision.ts_eval,
        ),
        PersistItem::DeadLetter { record, .. } => (record.envelope.clone(), record.first_seen_ts),
    };
    DeadLetterRecord::new(envelope, ENCODE_ERROR_REASON, detail, ts)
}

/// Returns whether the raw row was new
fn insert_event(
    tx: &Transaction<'_>,
    event: &MarketEvent,
    offset: Option<u64>,
) -> Result<bool, StorageError> {
    let payload = serde_json::to_string(&event.raw_payload)
        .map_err(|e| StorageError::Encode(e.to_string()))?;

    let inserted = tx
        .prepare_cached(
            "INSERT INTO events_raw
             (event_type, idempotency_key, ts_event, ts_produced, source, schema_version, payload, stream_offset)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (event_type, idempotency_key) DO NOTHING",
        )?
        .execute(params![
            event.event_type.as_str(),
            event.idempotency_key,
            event.ts_event,
            event.ts_produced,
            event.source,
            event.schema_version,
            payload,
            offset.map(to_i64),
        ])?
        > 0;

    if !inserted {
        return Ok(false);
    }

    let key = event.idempotency_key.as_str();
    match &event.payload {
        EventPayload::SpotTick(tick) => upsert_spot(tx, tick, key)?,
        EventPayload::QuoteUpdate(quote) => upsert_quote(tx, quote, key)?,
        EventPayload::MarketLifecycle(lifecycle) => {
            upsert_lifecycle(tx, lifecycle, event.ts_event, key)?
        }
        EventPayload::ContractUpdate(contract) => {
            upsert_contract(tx, contract, event.ts_event, key)?
        }
    }
    Ok(true)
}

fn upsert_spot(tx: &Transaction<'_>, tick: &SpotTick, key: &str) -> Result<(), StorageError> {
    tx.prepare_cached(concat!(
        "INSERT INTO state_spot_latest (product_id, ts, price, sequence_num, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (product_id) DO UPDATE SET
            ts = excluded.ts, price = excluded.price,
            sequence_num = excluded.sequence_num, idempotency_key = excluded.idempotency_key",
        forward_only!("state_spot_latest")
    ))?
    .execute(params![
        tick.product_id,
        tick.ts,
        tick.price,
        tick.sequence_num.map(to_i64),
        key
    ])?;
    Ok(())
}

fn upsert_quote(tx: &Transaction<'_>, quote: &QuoteUpdate, key: &str) -> Result<(), StorageError> {
    let derived = TwoSidedQuote::new(quote.yes_bid, quote.no_bid);
    tx.prepare_cached(concat!(
        "INSERT INTO state_quote_latest (market_id, ts, yes_bid, no_bid, yes_ask, no_ask, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (market_id) DO UPDATE SET
            ts = excluded.ts, yes_bid = excluded.yes_bid, no_bid = excluded.no_bid,
            yes_ask = excluded.yes_ask, no_ask = excluded.no_ask,
            idempotency_key = excluded.idempotency_key",
        forward_only!("state_quote_latest")
    ))?
    .execute(params![
        quote.market_id,
        quote.ts,
        quote.yes_bid,
        quote.no_bid,
        derived.yes_ask(),
        derived.no_ask(),
        key
    ])?;
    Ok(())
}

fn upsert_lifecycle(
    tx: &Transaction<'_>,
    lifecycle: &MarketLifecycle,
    ts: i64,
    key: &str,
) -> Result<(), StorageError> {
    tx.prepare_cached(concat!(
        "INSERT INTO state_lifecycle_latest
         (market_id, ts, status, close_ts, expected_expiration_ts, expiration_ts, settlement_ts, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (market_id) DO UPDATE SET
            ts = excluded.ts, status = excluded.status, close_ts = excluded.close_ts,
            expected_expiration_ts = excluded.expected_expiration_ts,
            expiration_ts = excluded.expiration_ts, settlement_ts = excluded.settlement_ts,
            idempotency_key = excluded.idempotency_key",
        forward_only!("state_lifecycle_latest")
    ))?
    .execute(params![
        lifecycle.market_id,
        ts,
        lifecycle.status.as_str(),
        lifecycle.close_ts,
        lifecycle.expected_expiration_ts,
        lifecycle.expiration_ts,
        lifecycle.settlement_ts,
        key
    ])?;
    Ok(())
}

fn upsert_contract(
    tx: &Transaction<'_>,
    contract: &ContractUpdate,
    ts: i64,
    key: &str,
) -> Result<(), StorageError> {
    let shape = contract.shape;
    tx.prepare_cached(concat!(
        "INSERT INTO state_contract_latest
         (ticker, ts, strike_type, lower, upper, close_ts, expected_expiration_ts, expiration_ts,
          settled_ts, outcome, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (ticker) DO UPDATE SET
            ts = excluded.ts, strike_type = excluded.strike_type, lower = excluded.lower,
            upper = excluded.upper, close_ts = excluded.close_ts,
            expected_expiration_ts = excluded.expected_expiration_ts,
            expiration_ts = excluded.expiration_ts, settled_ts = excluded.settled_ts,
            outcome = excluded.outcome, idempotency_key = excluded.idempotency_key",
        forward_only!("state_contract_latest")
    ))?
    .execute(params![
        contract.ticker,
        ts,
        shape.map(|s| s.kind()),
        shape.and_then(|s| s.lower()),
        shape.and_then(|s| s.upper()),
        contract.close_ts,
        contract.expected_expiration_ts,
        contract.expiration_ts,
        contract.settled_ts,
        contract.outcome,
        key
    ])?;
    Ok(())
}

fn insert_edge(tx: &Transaction<'_>, edge: &EdgeSnapshot) -> Result<bool, StorageError> {
    let changed = tx
        .prepare_cached(
            "INSERT INTO edge_snapshots
             (asof_ts, market_id, product_id, strategy_version, settlement_ts, horizon_s, spot, spot_ts,
              sigma, sigma_source, sigma_reason, prob_yes, yes_bid, yes_ask, no_bid, no_ask,
              quote_ts, p_market, ev_take_yes, ev_take_no, skip_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT (asof_ts, market_id, strategy_version) DO NOTHING",
        )?
        .execute(params![
            edge.asof_ts,
            edge.market_id,
            edge.product_id,
            edge.strategy_version,
            edge.settlement_ts,
            edge.horizon_s,
            finite("spot", edge.spot)?,
            edge.spot_ts,
            finite("sigma", edge.sigma)?,
            edge.sigma_source.map(|s| s.as_str()),
            edge.sigma_reason,
            finite("prob_yes", edge.prob_yes)?,
            finite("yes_bid", edge.yes_bid)?,
            finite("yes_ask", edge.yes_ask)?,
            finite("no_bid", edge.no_bid)?,
            finite("no_ask", edge.no_ask)?,
            edge.quote_ts,
            finite("p_market", edge.p_market)?,
            finite("ev_take_yes", edge.ev_take_yes)?,
            finite("ev_take_no", edge.ev_take_no)?,
            edge.skip_reasons.to_column(),
        ])?;
    Ok(changed > 0)
}

fn insert_decision(tx: &Transaction<'_>, decision: &OpportunityDecision) -> Result<bool, StorageError> {
    let changed = tx
        .prepare_cached(
            "INSERT INTO opportunity_decisions
             (ts_eval, market_id, strategy_version, side, eligible, state, reason, ev_net, shadow)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (ts_eval, market_id, side, strategy_version) DO NOTHING",
        )?
        .execute(params![
            decision.ts_eval,
            decision.market_id,
            decision.strategy_version,
            decision.side.as_str(),
            decision.eligible,
            decision.state.as_str(),
            decision.reason,
            finite("ev_net", decision.ev_net)?,
            decision.shadow,
        ])?;
    Ok(changed > 0)
}

fn insert_dead_letter(tx: &Transaction<'_>, record: &DeadLetterRecord) -> Result<(), StorageError> {
    let envelope =
        serde_json::to_string(&record.envelope).map_err(|e| StorageError::Encode(e.to_string()))?;
    tx.prepare_cached(
        "INSERT INTO dead_letters
         (fingerprint, subject, error_reason, error_detail, first_seen_ts, envelope, acknowledged)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
         ON CONFLICT (fingerprint) DO NOTHING",
    )?
    .execute(params![
        record.fingerprint,
        record.subject,
        record.error_reason,
        record.error_detail,
        record.first_seen_ts,
        envelope,
    ])?;
    Ok(())
}
