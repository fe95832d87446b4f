//! Common utilities for all binaries
//!
//! Shared CLI parsing and config resolution. Logging goes through
//! [`skarv_core::utils::init_logging`].

use anyhow::Result;
use clap::Parser;
use skarv_core::config::{Exchange, FeedConfig};
use skarv_core::data::SyncMode;

/// Common CLI arguments for all binaries
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Exchange to connect to (spot, futures)
    #[arg(short, long, default_value = "spot")]
    pub exchange: String,

    /// Distribution mode (shared, broadcast, shared_memory)
    #[arg(short, long, default_value = "broadcast")]
    pub mode: String,

    /// Levels per side in emitted slices
    #[arg(short, long, default_value = "15")]
    pub depth: u32,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// Resolve the CLI arguments into a validated [`FeedConfig`].
    pub fn feed_config(&self) -> Result<FeedConfig> {
        let exchange = match self.exchange.as_str() {
            "spot" => Exchange::Spot,
            "futures" => Exchange::Futures,
            other => anyhow::bail!("unknown exchange '{other}' (expected spot or futures)"),
        };
        let mode = match self.mode.as_str() {
            "shared" => SyncMode::Shared,
            "broadcast" => SyncMode::Broadcast,
            "shared_memory" => SyncMode::SharedMemory,
            other => anyhow::bail!(
                "unknown mode '{other}' (expected shared, broadcast or shared_memory)"
            ),
        };
        let config = FeedConfig {
            mode,
            exchange,
            depth: self.depth,
        };
        config.validate()?;
        Ok(config)
    }

    /// Install the tracing subscriber per the CLI flags.
    pub fn init_logging(&self) {
        skarv_core::utils::init_logging(&self.log_level, self.json_logs);
    }
}
