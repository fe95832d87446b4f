//! Order-book state engine.
//!
//! Stores every active price level per side and derives top-N slices with
//! cumulative totals and depth percentages. Bids and asks live in
//! `BTreeMap<OrderedFloat<f64>, f64>` so best-first iteration is a range
//! walk: descending for bids, ascending for asks.
//!
//! Numeric hygiene: any pair that fails strict parsing is skipped, never an
//! error. A size of zero removes the level; any positive size upserts. The
//! book therefore never holds a zero-size or non-finite level.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use tracing::warn;

use crate::data::{now_ms, parse_level, DepthSnapshot, OrderbookSlice, PriceLevel, RawDelta};

/// Order-book state for a single instrument.
#[derive(Debug)]
pub struct BookEngine {
    /// Bid levels, price → size. Iterated in reverse for best-first.
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    /// Ask levels, price → size. Natural order is best-first.
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    /// Sequence id of the last applied snapshot or delta.
    last_update_id: u64,
    /// Levels per side emitted in slices.
    depth: u32,
    /// Set by every mutation; cleared when the host publishes.
    dirty: bool,
}

impl BookEngine {
    pub fn new(depth: u32) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            depth,
            dirty: false,
        }
    }

    /// Replace the entire book with the snapshot contents.
    ///
    /// Pairs with non-finite components are skipped; zero-size levels are
    /// not retained.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for pair in &snapshot.bids {
            if let Some((price, size)) = parse_level(pair) {
                if size > 0.0 {
                    self.bids.insert(OrderedFloat(price), size);
                }
            }
        }
        for pair in &snapshot.asks {
            if let Some((price, size)) = parse_level(pair) {
                if size > 0.0 {
                    self.asks.insert(OrderedFloat(price), size);
                }
            }
        }

        self.last_update_id = snapshot.last_update_id;
        self.dirty = true;
    }

    /// Apply one diff-depth event.
    ///
    /// Size zero removes the level, any positive size upserts, non-finite
    /// pairs are skipped. Idempotent: re-applying an overlapping delta
    /// converges to the same state.
    pub fn apply_delta(&mut self, delta: &RawDelta) {
        for pair in &delta.bids {
            if let Some((price, size)) = parse_level(pair) {
                if size == 0.0 {
                    self.bids.remove(&OrderedFloat(price));
                } else {
                    self.bids.insert(OrderedFloat(price), size);
                }
            }
        }
        for pair in &delta.asks {
            if let Some((price, size)) = parse_level(pair) {
                if size == 0.0 {
                    self.asks.remove(&OrderedFloat(price));
                } else {
                    self.asks.insert(OrderedFloat(price), size);
                }
            }
        }

        self.last_update_id = delta.final_update_id;
        self.dirty = true;
    }

    /// Derive a top-N slice from current state.
    ///
    /// Depth percent per level is `round(cumulative / max_total * 10_000) / 100`
    /// where `max_total` is the larger of the two sides' final cumulatives;
    /// zero when the book is empty. Spread and midpoint are zero unless both
    /// sides are populated.
    pub fn slice(&self) -> OrderbookSlice {
        let depth = self.depth as usize;

        let mut bids = Vec::with_capacity(depth.min(self.bids.len()));
        let mut cumulative = 0.0;
        for (&OrderedFloat(price), &size) in self.bids.iter().rev().take(depth) {
            cumulative += size;
            bids.push(PriceLevel {
                price,
                size,
                cumulative,
                depth_percent: 0.0,
            });
        }
        let bid_total = cumulative;

        let mut asks = Vec::with_capacity(depth.min(self.asks.len()));
        let mut cumulative = 0.0;
        for (&OrderedFloat(price), &size) in self.asks.iter().take(depth) {
            cumulative += size;
            asks.push(PriceLevel {
                price,
                size,
                cumulative,
                depth_percent: 0.0,
            });
        }
        let ask_total = cumulative;

        let max_total = bid_total.max(ask_total);
        if max_total > 0.0 {
            for level in bids.iter_mut().chain(asks.iter_mut()) {
                level.depth_percent = (level.cumulative / max_total * 10_000.0).round() / 100.0;
            }
        }

        let (spread, spread_percent, midpoint) = match (bids.first(), asks.first()) {
            (Some(bid), Some(ask)) => {
                let spread = ask.price - bid.price;
                let midpoint = (bid.price + ask.price) / 2.0;
                let spread_percent = if midpoint > 0.0 { spread / midpoint } else { 0.0 };
                (spread, spread_percent, midpoint)
            }
            _ => (0.0, 0.0, 0.0),
        };

        OrderbookSlice {
            bids,
            asks,
            spread,
            spread_percent,
            midpoint,
            timestamp_ms: now_ms(),
            last_update_id: self.last_update_id,
        }
    }

    /// Change the number of levels per side for future slices.
    ///
    /// Stored levels are untouched.
    pub fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
        self.dirty = true;
    }

    /// Clear all state for a resync.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.dirty = false;
    }

    /// Consume the dirty flag, returning whether a publish is due.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of stored levels, (bids, asks).
    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Best bid price, if any.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|p| p.0)
    }

    /// Best ask price, if any.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|p| p.0)
    }

    /// Log (but do not reject) a crossed book. A transient cross can occur
    /// while replaying overlapping deltas around a snapshot boundary.
    pub fn warn_if_crossed(&self) {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                warn!(bid, ask, "book is crossed");
            }
        }
    }
}

impl Default for BookEngine {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DEPTH)
    }
}
