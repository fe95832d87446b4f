//! Core data model: deltas, snapshots, slices, status, metrics.
//!
//! Prices and sizes are plain `f64` end-to-end. The exchange sends them as
//! decimal strings; [`parse_level`] converts a pair strictly, rejecting
//! anything non-finite so a malformed level can never poison the book.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch, as `f64`.
///
/// The fractional part is kept; the shared-memory layout stores this field
/// as an `f64` and round-trips must be bit-exact.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// One price level of an emitted slice.
///
/// `cumulative` is the running sum of sizes from the top of the side down to
/// this level; `depth_percent` is `cumulative / max(bid_total, ask_total)`
/// scaled to `[0, 100]` and rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative: f64,
    pub depth_percent: f64,
}

/// A diff-depth event as received from the exchange stream.
///
/// Field names mirror the wire payload. `first_update_id` (`U`) and
/// `final_update_id` (`u`) bracket the range of sequence ids the event
/// covers; `final_update_id >= first_update_id` always holds on a
/// well-formed stream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDelta {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time_ms: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

impl RawDelta {
    /// `true` if this frame is a depth update with a valid id range.
    pub fn is_depth_update(&self) -> bool {
        self.event_type == "depthUpdate" && self.final_update_id >= self.first_update_id
    }
}

/// One-shot REST depth snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Strictly parse a `(price, qty)` string pair.
///
/// Returns `None` when either component fails to parse or is non-finite.
/// A zero or negative quantity is still returned (zero means "remove the
/// level"); a non-positive price is rejected.
pub fn parse_level(pair: &[String; 2]) -> Option<(f64, f64)> {
    let price: f64 = pair[0].parse().ok()?;
    let size: f64 = pair[1].parse().ok()?;
    if !price.is_finite() || !size.is_finite() || price <= 0.0 || size < 0.0 {
        return None;
    }
    Some((price, size))
}

/// Top-N order-book slice derived from book state at a moment in time.
///
/// Bids are ordered best-first (descending price), asks best-first
/// (ascending price). Immutable once published; equality is field-by-field
/// with bit-exact `f64` comparison.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderbookSlice {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub spread: f64,
    pub spread_percent: f64,
    pub midpoint: f64,
    pub timestamp_ms: f64,
    pub last_update_id: u64,
}

impl OrderbookSlice {
    /// Best bid price, if the bid side is non-empty.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if the ask side is non-empty.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Syncing,
    Connected,
    Reconnecting,
    Error(String),
}

impl ConnectionStatus {
    /// `true` for the terminal error variant.
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionStatus::Error(_))
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

/// Latency statistics over the frame bridge's rolling window, in ms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub current_ms: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    /// Sort-and-index p95 over a 100-sample rolling window.
    pub p95_ms: f64,
}

/// Consumer-side diagnostics, refreshed roughly once per second.
///
/// `heap_used_mb`/`heap_growth_mb` are populated only where the embedding
/// process exposes allocator statistics; they default to zero otherwise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub messages_per_second: f64,
    pub latency: LatencyStats,
    pub fps: u32,
    pub dropped_frames: u64,
    pub heap_used_mb: f64,
    pub heap_growth_mb: f64,
    pub reconnect_count: u32,
    pub sequence_gaps: u64,
    pub tab_count: usize,
}

/// Partial metrics frame; `None` fields leave the target untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsPatch {
    pub messages_per_second: Option<f64>,
    pub latency: Option<LatencyStats>,
    pub fps: Option<u32>,
    pub dropped_frames: Option<u64>,
    pub reconnect_count: Option<u32>,
    pub sequence_gaps: Option<u64>,
    pub tab_count: Option<usize>,
}

impl MetricsPatch {
    /// Merge this patch into `target`.
    pub fn apply(&self, target: &mut Metrics) {
        if let Some(v) = self.messages_per_second {
            target.messages_per_second = v;
        }
        if let Some(v) = self.latency {
            target.latency = v;
        }
        if let Some(v) = self.fps {
            target.fps = v;
        }
        if let Some(v) = self.dropped_frames {
            target.dropped_frames = v;
        }
        if let Some(v) = self.reconnect_count {
            target.reconnect_count = v;
        }
        if let Some(v) = self.sequence_gaps {
            target.sequence_gaps = v;
        }
        if let Some(v) = self.tab_count {
            target.tab_count = v;
        }
    }

    /// Patch carrying only a tab count.
    pub fn tab_count(count: usize) -> Self {
        Self {
            tab_count: Some(count),
            ..Default::default()
        }
    }
}

/// Fabric selection / sync-mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Shared,
    Broadcast,
    SharedMemory,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Shared
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMode::Shared => "shared",
            SyncMode::Broadcast => "broadcast",
            SyncMode::SharedMemory => "shared_memory",
        };
        f.write_str(s)
    }
}
