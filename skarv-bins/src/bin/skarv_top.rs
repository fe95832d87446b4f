//! Live top-of-book viewer.
//!
//! Connects a producer host to the configured exchange, routes slices
//! through the frame bridge into the reactive store, and prints the top
//! of the book once per second along with bridge metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Spot feed, default depth
//! skarv-top
//!
//! # Futures feed, 20 levels, shared-memory transport
//! skarv-top --exchange futures --depth 20 --mode shared_memory
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use skarv_bins::common::CommonArgs;
use skarv_core::data::SyncMode;
use skarv_core::fabric::{EventPublisher, ShmPublisher, SlicePublisher, SliceRegion, SliceWriter};
use skarv_core::prelude::*;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "skarv-top")]
#[command(about = "Print live top-of-book slices", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.common.init_logging();

    let config = args.common.feed_config()?;
    let endpoints = config.endpoints();
    tracing::info!(
        exchange = ?config.exchange,
        mode = %config.mode,
        depth = config.depth,
        url = %endpoints.stream_url(),
        "starting feed"
    );

    let store = ReactiveStore::new();
    store.set_sync_mode(config.mode);

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // The broadcast and shared modes move slices as messages; the
    // shared-memory mode writes them into an atomic region and only the
    // handshake travels over the channel.
    let publisher: Box<dyn SlicePublisher> = match config.mode {
        SyncMode::SharedMemory => {
            let writer = SliceWriter::new(SliceRegion::new());
            Box::new(ShmPublisher::new(writer, event_tx.clone()))
        }
        _ => Box::new(EventPublisher::new(event_tx.clone())),
    };

    let producer = ProducerHost::spawn(config.depth, publisher);
    producer.connect(&endpoints);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = FrameBridge::new(store.clone());
    let bridge_task = tokio::spawn(bridge.run(event_rx, shutdown_rx));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = (args.duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(args.duration_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => print_top(&store),
            _ = tokio::signal::ctrl_c() => break,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => break,
        }
    }

    tracing::info!("shutting down");
    producer.disconnect();
    let _ = shutdown_tx.send(true);
    let _ = bridge_task.await;
    Ok(())
}

fn print_top(store: &ReactiveStore) {
    let status = store.status();
    let metrics = store.metrics();

    match store.displayed_slice() {
        Some(slice) => {
            let bid = slice
                .best_bid()
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "-".into());
            let ask = slice
                .best_ask()
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "-".into());
            println!(
                "{status:?} | bid {bid} ask {ask} spread {:.2} mid {:.2} | \
                 {:.1} msg/s {} fps {} dropped | lat cur {:.1}ms p95 {:.1}ms | seq_gaps {}",
                slice.spread,
                slice.midpoint,
                metrics.messages_per_second,
                metrics.fps,
                metrics.dropped_frames,
                metrics.latency.current_ms,
                metrics.latency.p95_ms,
                metrics.sequence_gaps,
            );
        }
        None => println!("{status:?} | waiting for first slice"),
    }
}
