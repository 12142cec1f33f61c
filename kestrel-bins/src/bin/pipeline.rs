//! Decision pipeline over a JSONL envelope stream
//!
//! One envelope per line; the zero-based line number is the stream offset.
//! On start the State Builder is restored from the last checkpoint and the
//! stream is replayed from after the offset both the checkpoint and the store
//! have reached. Re-applying already-seen envelopes is a no-op.
//!
//! ```text
//! kestrel-pipeline --config kestrel.toml --input events.jsonl --clock event
//! ```
//!
//! With `--clock event` ages and ticks follow the newest `ts_event` seen,
//! which makes a recorded stream replay deterministically. `--clock wall`
//! uses the system clock, for a live tail piped into stdin; a silent feed
//! still ticks, so the health line reports the data gap.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kestrel_bins::common::{init_logging, load_config, CommonArgs};
use kestrel_bins::driver::{drive, tick, Clock, ClockMode, DriveOptions, LineFeed};
use kestrel_core::config::KestrelConfig;
use kestrel_core::engine::Pipeline;
use kestrel_core::monitoring::MetricsRegistry;
use kestrel_core::persistence::{EventStore, PersistSink, PersistenceService, SqliteStore};
use kestrel_core::resilience::{DependencyHealth, ShutdownState, ShutdownSwitch};
use kestrel_core::state::{replay_start, Checkpoint, StateBuilder};
use kestrel_strategies::EdgeEvaluator;
use std::fs::File;
use std::io::{self, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the Kestrel decision pipeline")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// JSONL envelope stream, `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Clock that drives ages and evaluation ticks
    #[arg(long, value_enum, default_value_t = ClockMode::Event)]
    clock: ClockMode,

    /// Seconds between evaluation ticks
    #[arg(long, default_value_t = 5)]
    tick_secs: i64,

    /// Print the Prometheus text exposition on exit
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.common)?;
    init_logging(&args.common, &config.logging)?;

    if args.tick_secs <= 0 {
        bail!("--tick-secs must be positive");
    }

    info!("=== Kestrel decision pipeline ===");
    info!(
        db = %config.persistence.db_path.display(),
        checkpoint = %config.checkpoint.path.display(),
        strategy_version = %config.edge.strategy_version,
        clock = ?args.clock,
        "configuration loaded"
    );

    let shutdown = ShutdownSwitch::new();
    shutdown
        .install_ctrlc()
        .context("installing Ctrl+C handler")?;

    let metrics = MetricsRegistry::new().context("creating metrics registry")?;
    let dependencies = DependencyHealth::new();

    let store = SqliteStore::open(&config.persistence.db_path).with_context(|| {
        format!("opening store {}", config.persistence.db_path.display())
    })?;
    let committed = store
        .committed_offset(&config.persistence.stream)
        .context("reading committed offset")?;
    let sigmas = store.latest_sigmas().context("reading persisted sigmas")?;

    let checkpoint = Checkpoint::load(&config.checkpoint.path).context("loading checkpoint")?;
    let start = replay_start(checkpoint.as_ref().and_then(|c| c.last_offset), committed);
    let builder = match checkpoint {
        Some(checkpoint) => {
            info!(
                offset = ?checkpoint.last_offset,
                markets = checkpoint.markets.len(),
                "restoring from checkpoint"
            );
            StateBuilder::from_checkpoint(config.ingest.clone(), checkpoint)
        }
        None => {
            info!("no checkpoint, building projection from the stream");
            StateBuilder::new(config.ingest.clone())
        }
    };
    info!(committed = ?committed, replay_from = start, "replay position");

    let evaluator = EdgeEvaluator::new(config.edge.clone(), config.opportunity.clone())
        .with_metrics(metrics.strategy().clone());
    for (product_id, sigma) in &sigmas {
        if evaluator.seed_sigma(product_id, *sigma) {
            info!(product_id = %product_id, sigma, "sigma seeded from store");
        } else {
            warn!(product_id = %product_id, sigma, "persisted sigma rejected, not seeding");
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("kestrel-persist")
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let handle = {
        let _guard = runtime.enter();
        PersistenceService::new(store, &config.persistence)
            .with_dependencies(dependencies.clone())
            .with_metrics(metrics.persistence().clone())
            .spawn(config.ingest.channel_capacity, shutdown.subscribe())
    };
    let sender = handle
        .sender()
        .context("persistence writer has no producer handle")?;

    let mut pipeline = Pipeline::new(&config, builder, evaluator, sender)
        .with_metrics(metrics.clone())
        .with_dependencies(dependencies);

    let outcome = run(&mut pipeline, &args, &config, start, &shutdown);
    let stats = pipeline.stats();
    // the pipeline owns a sender; the writer only finishes once it is gone
    drop(pipeline);

    let persisted = runtime.block_on(handle.join());

    info!("=== Final Statistics ===");
    info!("Envelopes consumed: {}", stats.envelopes);
    info!("Applied: {}  discarded: {}", stats.applied, stats.discarded);
    info!("Dead-lettered: {}", stats.dead_lettered);
    info!("Ticks: {}  edges: {}  decisions: {}", stats.ticks, stats.edges, stats.decisions);
    info!("Checkpoints: {}", stats.checkpoints);
    match &persisted {
        Ok(p) => info!(
            "Persisted: {} inserted, {} duplicates, {} dead-lettered, {} batches, {} retries, {} abandoned",
            p.inserted, p.duplicates, p.dead_lettered, p.batches, p.retries, p.abandoned
        ),
        Err(e) => error!(error = %e, "persistence writer failed"),
    }

    if args.metrics {
        println!("{}", metrics.encode_text().context("encoding metrics")?);
    }

    outcome?;
    persisted.context("persistence writer failed")?;
    Ok(())
}

fn run<S: PersistSink>(
    pipeline: &mut Pipeline<EdgeEvaluator, S>,
    args: &Args,
    config: &KestrelConfig,
    start: u64,
    shutdown: &ShutdownSwitch,
) -> Result<()> {
    let capacity = config.ingest.channel_capacity;
    let mut feed = if args.input == "-" {
        LineFeed::spawn(BufReader::new(io::stdin()), capacity)
    } else {
        let file = File::open(&args.input).with_context(|| format!("opening {}", args.input))?;
        LineFeed::spawn(BufReader::new(file), capacity)
    }
    .context("starting input reader")?;

    let mut clock = Clock::new(args.clock);
    let options = DriveOptions::for_clock(args.clock, args.tick_secs, start);
    let now = drive(pipeline, &mut feed, &mut clock, &options, shutdown)?;

    // once draining, the writer no longer accepts new records
    if !shutdown.should_stop() {
        tick(pipeline, now)?;
    }
    if shutdown.state() != ShutdownState::Abort {
        pipeline.write_checkpoint(now).with_context(|| {
            format!("writing final checkpoint {}", config.checkpoint.path.display())
        })?;
    }
    Ok(())
}
