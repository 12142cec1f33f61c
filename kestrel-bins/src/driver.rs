//! Input loop for `kestrel-pipeline`
//!
//! Lines are read on their own thread into a bounded channel, so evaluation
//! ticks do not wait on input. Under the wall clock an idle feed still ticks
//! every `idle_wait`, which lets the degraded-mode controller see ages grow
//! during a data gap. Under the event clock time only moves with the stream,
//! so the loop blocks on the next line.

use anyhow::{Context, Result};
use clap::ValueEnum;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use kestrel_core::engine::{Evaluator, Pipeline};
use kestrel_core::persistence::PersistSink;
use kestrel_core::resilience::ShutdownSwitch;
use kestrel_core::utils::now_ts;
use serde_json::Value;
use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockMode {
    Event,
    Wall,
}

/// Evaluation clock; the event clock never moves backwards
pub struct Clock {
    mode: ClockMode,
    event_now: Option<i64>,
    wall: Box<dyn Fn() -> i64 + Send>,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            event_now: None,
            wall: Box::new(now_ts),
        }
    }

    /// Replace the system clock as the wall source
    pub fn with_wall_source(mut self, wall: impl Fn() -> i64 + Send + 'static) -> Self {
        self.wall = Box::new(wall);
        self
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    fn observe(&mut self, raw: &Value) {
        if let Some(ts) = raw.get("ts_event").and_then(Value::as_i64) {
            self.event_now = Some(self.event_now.map_or(ts, |now| now.max(ts)));
        }
    }

    pub fn now(&self) -> i64 {
        match self.mode {
            ClockMode::Wall => (self.wall)(),
            ClockMode::Event => self.event_now.unwrap_or_else(|| (self.wall)()),
        }
    }
}

#[derive(Debug)]
pub enum FeedItem {
    /// One input line and its zero-based offset
    Line { offset: u64, line: String },
    /// Nothing arrived within the wait
    Idle,
    Closed,
}

/// Input lines delivered over a bounded channel
pub struct LineFeed {
    rx: Receiver<io::Result<String>>,
    next_offset: u64,
}

impl LineFeed {
    /// Feed with the producing end left to the caller
    pub fn channel(capacity: usize) -> (Sender<io::Result<String>>, Self) {
        let (tx, rx) = bounded(capacity);
        (tx, Self { rx, next_offset: 0 })
    }

    /// Read `input` line by line on a dedicated thread
    pub fn spawn<R: BufRead + Send + 'static>(input: R, capacity: usize) -> io::Result<Self> {
        let (tx, feed) = Self::channel(capacity);
        thread::Builder::new()
            .name("kestrel-input".to_string())
            .spawn(move || {
                for line in input.lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;
        Ok(feed)
    }

    /// Next line, waiting at most `wait` (forever when `None`)
    pub fn next(&mut self, wait: Option<Duration>) -> Result<FeedItem> {
        let received = match wait {
            None => self.rx.recv().ok(),
            Some(wait) => match self.rx.recv_timeout(wait) {
                Ok(line) => Some(line),
                Err(RecvTimeoutError::Timeout) => return Ok(FeedItem::Idle),
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        let Some(line) = received else {
            return Ok(FeedItem::Closed);
        };

        let offset = self.next_offset;
        self.next_offset += 1;
        let line = line.with_context(|| format!("reading line {offset}"))?;
        Ok(FeedItem::Line { offset, line })
    }
}

#[derive(Debug, Clone)]
pub struct DriveOptions {
    /// Seconds between evaluation ticks
    pub tick_secs: i64,
    /// First offset not yet reflected in both checkpoint and store
    pub start: u64,
    /// How long to wait for input before an idle tick; `None` blocks
    pub idle_wait: Option<Duration>,
}

impl DriveOptions {
    pub fn for_clock(mode: ClockMode, tick_secs: i64, start: u64) -> Self {
        let idle_wait = match mode {
            ClockMode::Wall => Some(Duration::from_secs(1)),
            ClockMode::Event => None,
        };
        Self {
            tick_secs,
            start,
            idle_wait,
        }
    }
}

/// Consume the feed until it closes or shutdown is requested
///
/// Returns the clock reading at exit, for the final tick and checkpoint.
pub fn drive<E: Evaluator, S: PersistSink>(
    pipeline: &mut Pipeline<E, S>,
    feed: &mut LineFeed,
    clock: &mut Clock,
    options: &DriveOptions,
    shutdown: &ShutdownSwitch,
) -> Result<i64> {
    let mut next_tick: Option<i64> = None;
    let mut skipped = 0u64;

    loop {
        if shutdown.should_stop() {
            warn!("shutdown requested, stopping ingest");
            break;
        }

        let (offset, line) = match feed.next(options.idle_wait)? {
            FeedItem::Closed => break,
            FeedItem::Idle => {
                let now = clock.now();
                tick_if_due(pipeline, &mut next_tick, now, options.tick_secs)?;
                pipeline.checkpoint_if_due(now).context("writing checkpoint")?;
                continue;
            }
            FeedItem::Line { offset, line } => (offset, line),
        };

        if offset < options.start {
            skipped += 1;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        // undecodable lines still reach the dead-letter path
        let raw = serde_json::from_str::<Value>(&line).unwrap_or(Value::String(line));
        clock.observe(&raw);
        let now = clock.now();

        match pipeline.ingest(raw, offset, now) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(offset, error = %e, "fatal ingest error");
                return Err(e).context("ingest");
            }
            Err(e) => warn!(offset, error = %e, category = e.category(), "ingest error"),
        }

        tick_if_due(pipeline, &mut next_tick, now, options.tick_secs)?;
        pipeline.checkpoint_if_due(now).context("writing checkpoint")?;
    }

    if skipped > 0 {
        info!(skipped, "envelopes before the replay position skipped");
    }
    Ok(clock.now())
}

fn tick_if_due<E: Evaluator, S: PersistSink>(
    pipeline: &mut Pipeline<E, S>,
    next_tick: &mut Option<i64>,
    now: i64,
    tick_secs: i64,
) -> Result<()> {
    if next_tick.map_or(false, |due| now < due) {
        return Ok(());
    }
    tick(pipeline, now)?;
    *next_tick = Some(now + tick_secs);
    Ok(())
}

pub fn tick<E: Evaluator, S: PersistSink>(pipeline: &mut Pipeline<E, S>, now: i64) -> Result<()> {
    let report = pipeline.tick(now).context("evaluation tick")?;
    debug!(
        ts = report.ts,
        mode = report.mode.as_str(),
        markets = report.markets,
        skipped = report.skipped,
        would_trade = report.would_trade,
        "tick"
    );
    Ok(())
}
