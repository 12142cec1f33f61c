//! Common utilities for all binaries
//!
//! Shared initialization and CLI parsing.

use anyhow::{Context, Result};
use clap::Args;
use kestrel_core::config::{KestrelConfig, LoggingConfig};
use kestrel_core::utils::init_logger;
use std::path::PathBuf;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides `logging.level` (RUST_LOG still wins)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json: bool,
}

/// Defaults, then the file, then `KESTREL__*` environment overrides
pub fn load_config(args: &CommonArgs) -> Result<KestrelConfig> {
    let config = KestrelConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("loading configuration from {}", path.display()),
        None => "loading default configuration".to_string(),
    })?;
    Ok(config)
}

/// Initialize tracing/logging
pub fn init_logging(args: &CommonArgs, logging: &LoggingConfig) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(&logging.level);
    init_logger(level, args.json || logging.json).context("installing tracing subscriber")?;
    Ok(())
}
