//! Single-writer persistence service
//!
//! Exactly one task owns the store. Producers send [`PersistItem`]s over a
//! bounded channel; the service groups them into batches and commits each
//! batch in one transaction together with the highest stream offset it
//! contains.
//!
//! ## Lifecycle
//!
//! ```text
//!   recv ──▶ batch ──(full | max_wait)──▶ commit ──▶ retry w/ backoff
//!                                                     └─ exhausted ─▶ Err
//!   shutdown ──▶ close channel ──▶ drain within grace ──▶ stats
//! ```
//!
//! While commits are failing the `storage` dependency flag is down, which
//! the degraded-mode controller picks up as a trigger.

use super::batch::{Batch, BatchPolicy};
use super::store::{highest_offset, BatchOutcome, EventStore, PersistItem, PersistenceStats, StorageError};
use crate::config::PersistenceConfig;
use crate::monitoring::PersistenceMetrics;
use crate::resilience::{BackoffConfig, DependencyHealth, ExponentialBackoff, STORAGE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

pub struct PersistenceService<S: EventStore> {
    store: S,
    policy: BatchPolicy,
    backoff: BackoffConfig,
    stream: String,
    grace: Duration,
    dependencies: DependencyHealth,
    metrics: Option<PersistenceMetrics>,
    stats: Arc<Mutex<PersistenceStats>>,
}

impl<S: EventStore> PersistenceService<S> {
    pub fn new(store: S, config: &PersistenceConfig) -> Self {
        Self {
            store,
            policy: BatchPolicy::from(config),
            backoff: BackoffConfig::from(&config.retry),
            stream: config.stream.clone(),
            grace: config.shutdown_grace(),
            dependencies: DependencyHealth::new(),
            metrics: None,
            stats: Arc::new(Mutex::new(PersistenceStats::default())),
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Report store availability into a shared set of dependency flags
    pub fn with_dependencies(mut self, dependencies: DependencyHealth) -> Self {
        dependencies.register(STORAGE);
        self.dependencies = dependencies;
        self
    }

    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Live view of the running totals
    pub fn stats(&self) -> Arc<Mutex<PersistenceStats>> {
        Arc::clone(&self.stats)
    }

    /// Spawn the writer on the current runtime
    pub fn spawn(self, capacity: usize, shutdown: watch::Receiver<bool>) -> PersistenceHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = self.stats();
        let join = tokio::spawn(self.run(rx, shutdown));
        PersistenceHandle {
            tx: Some(tx),
            stats,
            join,
        }
    }

    /// Consume until the channel closes or shutdown is signalled, then drain
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PersistItem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PersistenceStats, StorageError> {
        info!(
            stream = %self.stream,
            max_items = self.policy.max_items,
            max_wait_ms = self.policy.max_wait.as_millis() as u64,
            "persistence service started"
        );

        let mut batch = Batch::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = batch.deadline(&self.policy);

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                item = rx.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.is_full(&self.policy) {
                            self.set_queue_depth(rx.len() + batch.len());
                            self.flush(&mut batch).await?;
                        }
                    }
                    None => break,
                },

                _ = flush_due(deadline) => {
                    self.set_queue_depth(rx.len() + batch.len());
                    self.flush(&mut batch).await?;
                }
            }
        }

        self.drain(rx, batch).await
    }

    async fn drain(
        &mut self,
        mut rx: mpsc::Receiver<PersistItem>,
        mut batch: Batch,
    ) -> Result<PersistenceStats, StorageError> {
        rx.close();
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }

        let pending = batch.len() as u64;
        let processed_before = self.stats.lock().processed;
        info!(pending, grace_ms = self.grace.as_millis() as u64, "draining persistence queue");

        let result = timeout_at(Instant::now() + self.grace, self.flush(&mut batch)).await;

        let committed = self.stats.lock().processed - processed_before;
        let abandoned = pending.saturating_sub(committed);
        if abandoned > 0 {
            self.stats.lock().abandoned += abandoned;
            warn!(abandoned, "shutdown grace elapsed with items still queued");
        }
        self.set_queue_depth(0);

        if let Ok(Err(e)) = result {
            return Err(e);
        }

        let stats = *self.stats.lock();
        info!(
            batches = stats.batches,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            dead_lettered = stats.dead_lettered,
            retries = stats.retries,
            "persistence service stopped"
        );
        Ok(stats)
    }

    async fn flush(&mut self, batch: &mut Batch) -> Result<(), StorageError> {
        while !batch.is_empty() {
            let chunk = batch.take_chunk(&self.policy);
            let outcome = self.commit_with_retry(&chunk).await?;
            self.record(&outcome);
        }
        Ok(())
    }

    async fn commit_with_retry(&mut self, items: &[PersistItem]) -> Result<BatchOutcome, StorageError> {
        let offset = highest_offset(items);
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());

        loop {
            let committed = self
                .store
                .commit_batch(items, offset.map(|o| (self.stream.as_str(), o)));

            match committed {
                Ok(outcome) => {
                    if !self.dependencies.is_available(STORAGE) {
                        info!(attempts = backoff.attempts() + 1, "storage recovered");
                    }
                    self.dependencies.set_available(STORAGE, true);
                    debug!(items = items.len(), ?offset, "batch committed");
                    return Ok(outcome);
                }
                Err(e) => {
                    self.dependencies.set_available(STORAGE, false);
                    let Some(delay) = backoff.next_delay() else {
                        let attempts = backoff.attempts() + 1;
                        error!(attempts, error = %e, items = items.len(), "batch commit retries exhausted");
                        return Err(StorageError::RetriesExhausted {
                            attempts,
                            last: e.to_string(),
                        });
                    };

                    warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch commit failed, retrying"
                    );
                    self.stats.lock().retries += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.commit_retries_total.inc();
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    fn record(&self, outcome: &BatchOutcome) {
        self.stats.lock().record_batch(outcome);
        if let Some(metrics) = &self.metrics {
            metrics.batches_total.inc();
            metrics.items_total.with_label_values(&["inserted"]).inc_by(outcome.inserted);
            metrics.items_total.with_label_values(&["duplicate"]).inc_by(outcome.duplicates);
            metrics
                .items_total
                .with_label_values(&["dead_lettered"])
                .inc_by(outcome.dead_lettered);
        }
    }

    fn set_queue_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.queue_depth.set(depth as i64);
        }
    }
}

async fn flush_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owner's view of a spawned writer
pub struct PersistenceHandle {
    tx: Option<mpsc::Sender<PersistItem>>,
    stats: Arc<Mutex<PersistenceStats>>,
    join: JoinHandle<Result<PersistenceStats, StorageError>>,
}

impl PersistenceHandle {
    /// A producer handle; the writer stops once every sender is dropped
    pub fn sender(&self) -> Option<mpsc::Sender<PersistItem>> {
        self.tx.clone()
    }

    pub fn stats(&self) -> PersistenceStats {
        *self.stats.lock()
    }

    /// Drop the owner's sender and wait for the writer to finish
    pub async fn join(mut self) -> Result<PersistenceStats, StorageError> {
        self.tx.take();
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(StorageError::Unavailable(format!("writer task failed: {e}"))),
        }
    }
}
