//! Redelivery through the persistence path
//!
//! The same envelope delivered any number of times ends up as one stored
//! event, and the committed offset only reflects what was actually consumed.

use kestrel_core::config::PersistenceConfig;
use kestrel_core::persistence::{
    BatchPolicy, EventStore, PersistItem, PersistenceService, SqliteStore,
};
use kestrel_core::testing::{quote_envelope, spot_tick_envelope, validated};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn event_at(raw: serde_json::Value, offset: u64) -> PersistItem {
    PersistItem::Event {
        event: validated(raw),
        offset: Some(offset),
    }
}

fn small_batches() -> BatchPolicy {
    BatchPolicy {
        max_wait: Duration::from_millis(5),
        max_items: 2,
        hard_ceiling: 16,
    }
}

#[tokio::test]
async fn test_spot_tick_delivered_three_times_is_one_row() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kestrel.db");
    let config = PersistenceConfig::default();

    let store = SqliteStore::open(&path).unwrap();
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let handle = PersistenceService::new(store, &config)
        .with_policy(small_batches())
        .spawn(16, shutdown);

    let tx = handle.sender().unwrap();
    for offset in [10, 11, 12] {
        let raw = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, Some(42));
        tx.send(event_at(raw, offset)).await.unwrap();
    }
    drop(tx);

    let stats = handle.join().await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.duplicates, 2);

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.event_count().unwrap(), 1);
    assert_eq!(store.committed_offset(&config.stream).unwrap(), Some(12));
    let (ts, price, _key) = store.spot_latest("BTC-USD").unwrap().unwrap();
    assert_eq!(ts, 1_700_000_000);
    assert_eq!(price, 60_000.0);
}

#[tokio::test]
async fn test_out_of_order_redelivery_keeps_latest_quote() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kestrel.db");
    let config = PersistenceConfig::default();

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let handle = PersistenceService::new(SqliteStore::open(&path).unwrap(), &config)
        .with_policy(small_batches())
        .spawn(16, shutdown);

    let newer = quote_envelope("KXBTC-T61000", 2_000, Some(55), Some(40), Some("b"));
    let older = quote_envelope("KXBTC-T61000", 1_000, Some(20), Some(75), Some("a"));
    let tx = handle.sender().unwrap();
    tx.send(event_at(newer.clone(), 0)).await.unwrap();
    tx.send(event_at(older, 1)).await.unwrap();
    tx.send(event_at(newer, 2)).await.unwrap();
    drop(tx);

    let stats = handle.join().await.unwrap();
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.duplicates, 1);

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.event_count().unwrap(), 2);
    let (ts, yes_bid, no_bid) = store.quote_latest("KXBTC-T61000").unwrap().unwrap();
    assert_eq!(ts, 2_000);
    assert_eq!(yes_bid, Some(0.55));
    assert_eq!(no_bid, Some(0.40));
}

#[test]
fn test_reopened_store_deduplicates_across_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kestrel.db");
    let tick = spot_tick_envelope("BTC-USD", 1_700_000_000, 60_000.0, Some(7));

    {
        let mut store = SqliteStore::open(&path).unwrap();
        let outcome = store
            .commit_batch(&[event_at(tick.clone(), 0)], Some(("market", 0)))
            .unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    let mut store = SqliteStore::open(&path).unwrap();
    let outcome = store
        .commit_batch(&[event_at(tick, 5)], Some(("market", 5)))
        .unwrap();
    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(store.event_count().unwrap(), 1);
    assert_eq!(store.committed_offset("market").unwrap(), Some(5));
}
