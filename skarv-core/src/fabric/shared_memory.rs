//! Lock-free shared-memory slice transport.
//!
//! A fixed 2048-byte little-endian region holds one encoded slice: a
//! 56-byte header followed by two 15-level tables. The region is stored as
//! 512 atomic 32-bit words so concurrent access is well-defined; word 0 is
//! the version counter and the only word carrying synchronization. The
//! writer stores all body words relaxed, then bumps the version with
//! release semantics; readers load the version with acquire semantics and
//! decode the whole region. The writer cadence (≤ ~10 Hz) sits far below
//! the reader cadence (≤ ~60 Hz), so overlap is not expected; a
//! compare-after-decode guard re-reads if a bump lands mid-decode.
//!
//! Layout (byte offsets):
//!
//! | 0    | i32 version (atomic)      |
//! | 4    | i32 bid_count (0..15)     |
//! | 8    | i32 ask_count (0..15)     |
//! | 12   | padding                   |
//! | 16   | f64 spread                |
//! | 24   | f64 spread_percent        |
//! | 32   | f64 midpoint              |
//! | 40   | f64 timestamp_ms          |
//! | 48   | f64 last_update_id        |
//! | 56   | 15 × 32-byte bid levels   |
//! | 536  | 15 × 32-byte ask levels   |

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::data::{OrderbookSlice, PriceLevel};

/// Total region size in bytes.
pub const REGION_SIZE: usize = 2048;

/// Maximum levels per side in the fixed tables.
pub const MAX_LEVELS: usize = 15;

const WORDS: usize = REGION_SIZE / 4;

const OFF_VERSION: usize = 0;
const OFF_BID_COUNT: usize = 4;
const OFF_ASK_COUNT: usize = 8;
const OFF_SPREAD: usize = 16;
const OFF_SPREAD_PERCENT: usize = 24;
const OFF_MIDPOINT: usize = 32;
const OFF_TIMESTAMP: usize = 40;
const OFF_LAST_UPDATE_ID: usize = 48;
const OFF_BIDS: usize = 56;
const OFF_ASKS: usize = 536;
const LEVEL_BYTES: usize = 32;

/// The shared slice region. Single writer, any number of readers.
pub struct SliceRegion {
    words: [AtomicU32; WORDS],
}

impl SliceRegion {
    /// Allocate a zeroed region.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            words: std::array::from_fn(|_| AtomicU32::new(0)),
        })
    }

    /// Current version (acquire: pairs with the writer's release bump).
    pub fn version(&self) -> i32 {
        self.words[OFF_VERSION / 4].load(Ordering::Acquire) as i32
    }

    fn bump_version(&self) {
        self.words[OFF_VERSION / 4].fetch_add(1, Ordering::Release);
    }

    fn store_u32(&self, offset: usize, value: u32) {
        debug_assert_eq!(offset % 4, 0);
        self.words[offset / 4].store(value, Ordering::Relaxed);
    }

    fn load_u32(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        self.words[offset / 4].load(Ordering::Relaxed)
    }

    fn store_f64(&self, offset: usize, value: f64) {
        let bits = value.to_bits();
        self.store_u32(offset, bits as u32);
        self.store_u32(offset + 4, (bits >> 32) as u32);
    }

    fn load_f64(&self, offset: usize) -> f64 {
        let lo = self.load_u32(offset) as u64;
        let hi = self.load_u32(offset + 4) as u64;
        f64::from_bits(lo | (hi << 32))
    }
}

impl std::fmt::Debug for SliceRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceRegion")
            .field("version", &self.version())
            .finish()
    }
}

/// Single-writer encoder over a [`SliceRegion`].
#[derive(Debug, Clone)]
pub struct SliceWriter {
    region: Arc<SliceRegion>,
}

impl SliceWriter {
    pub fn new(region: Arc<SliceRegion>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> Arc<SliceRegion> {
        Arc::clone(&self.region)
    }

    /// Encode the slice into the region and publish it with a version bump.
    ///
    /// `last_update_id` is stored as an `f64`; values beyond 2^53 lose
    /// precision (accepted by the wire contract).
    pub fn write(&self, slice: &OrderbookSlice) {
        let r = &self.region;
        let bid_count = slice.bids.len().min(MAX_LEVELS);
        let ask_count = slice.asks.len().min(MAX_LEVELS);

        r.store_u32(OFF_BID_COUNT, bid_count as u32);
        r.store_u32(OFF_ASK_COUNT, ask_count as u32);
        r.store_f64(OFF_SPREAD, slice.spread);
        r.store_f64(OFF_SPREAD_PERCENT, slice.spread_percent);
        r.store_f64(OFF_MIDPOINT, slice.midpoint);
        r.store_f64(OFF_TIMESTAMP, slice.timestamp_ms);
        r.store_f64(OFF_LAST_UPDATE_ID, slice.last_update_id as f64);

        for (i, level) in slice.bids.iter().take(bid_count).enumerate() {
            Self::write_level(r, OFF_BIDS + i * LEVEL_BYTES, level);
        }
        for (i, level) in slice.asks.iter().take(ask_count).enumerate() {
            Self::write_level(r, OFF_ASKS + i * LEVEL_BYTES, level);
        }

        // All prior stores become visible before the new version is.
        r.bump_version();
    }

    fn write_level(r: &SliceRegion, base: usize, level: &PriceLevel) {
        r.store_f64(base, level.price);
        r.store_f64(base + 8, level.size);
        r.store_f64(base + 16, level.cumulative);
        r.store_f64(base + 24, level.depth_percent);
    }
}

/// Polling reader with pooled level buffers.
///
/// The level pools are pre-allocated once; each successful poll reuses
/// them for decoding and allocates only the outgoing slice.
#[derive(Debug)]
pub struct SliceReader {
    region: Arc<SliceRegion>,
    last_version: i32,
    bid_pool: Vec<PriceLevel>,
    ask_pool: Vec<PriceLevel>,
}

impl SliceReader {
    pub fn new(region: Arc<SliceRegion>) -> Self {
        Self {
            region,
            last_version: 0,
            bid_pool: vec![PriceLevel::default(); MAX_LEVELS],
            ask_pool: vec![PriceLevel::default(); MAX_LEVELS],
        }
    }

    /// Version observed by the last poll or skip.
    pub fn observed_version(&self) -> i32 {
        self.last_version
    }

    /// Poll the region. Returns a decoded slice when the version moved,
    /// `None` when nothing changed.
    ///
    /// Re-decodes (bounded) if the version moves mid-decode, so the
    /// returned slice always matches a single write.
    pub fn poll(&mut self) -> Option<OrderbookSlice> {
        let mut version = self.region.version();
        if version == self.last_version {
            return None;
        }

        // Compare-after-decode torn-read guard. The writer runs at a
        // fraction of the poll cadence, so one retry is the common worst
        // case; the bound is a backstop against a runaway writer.
        for _ in 0..16 {
            let slice = self.decode();
            let after = self.region.version();
            if after == version {
                self.last_version = version;
                return Some(slice);
            }
            version = after;
        }

        self.last_version = version;
        Some(self.decode())
    }

    /// Advance the observed version without decoding.
    ///
    /// Used while the store is frozen so the pools backing the frozen
    /// view are not clobbered; returns whether the version had moved.
    pub fn skip(&mut self) -> bool {
        let version = self.region.version();
        let moved = version != self.last_version;
        self.last_version = version;
        moved
    }

    fn decode(&mut self) -> OrderbookSlice {
        let r = &self.region;

        // Clamp both counts to the table size regardless of what the
        // writer put there.
        let bid_count = (r.load_u32(OFF_BID_COUNT) as usize).min(MAX_LEVELS);
        let ask_count = (r.load_u32(OFF_ASK_COUNT) as usize).min(MAX_LEVELS);

        for i in 0..bid_count {
            self.bid_pool[i] = Self::read_level(r, OFF_BIDS + i * LEVEL_BYTES);
        }
        for i in 0..ask_count {
            self.ask_pool[i] = Self::read_level(r, OFF_ASKS + i * LEVEL_BYTES);
        }

        OrderbookSlice {
            bids: self.bid_pool[..bid_count].to_vec(),
            asks: self.ask_pool[..ask_count].to_vec(),
            spread: r.load_f64(OFF_SPREAD),
            spread_percent: r.load_f64(OFF_SPREAD_PERCENT),
            midpoint: r.load_f64(OFF_MIDPOINT),
            timestamp_ms: r.load_f64(OFF_TIMESTAMP),
            last_update_id: r.load_f64(OFF_LAST_UPDATE_ID) as u64,
        }
    }

    fn read_level(r: &SliceRegion, base: usize) -> PriceLevel {
        PriceLevel {
            price: r.load_f64(base),
            size: r.load_f64(base + 8),
            cumulative: r.load_f64(base + 16),
            depth_percent: r.load_f64(base + 24),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64, cumulative: f64, depth_percent: f64) -> PriceLevel {
        PriceLevel {
            price,
            size,
            cumulative,
            depth_percent,
        }
    }

    fn full_slice() -> OrderbookSlice {
        let bids = (0..15)
            .map(|i| {
                let price = 97500.0 - i as f64 * 0.5;
                level(price, 1.0 + i as f64 * 0.1, i as f64 + 1.0, i as f64 * 6.0)
            })
            .collect();
        let asks = (0..15)
            .map(|i| {
                let price = 97500.5 + i as f64 * 0.5;
                level(price, 2.0 + i as f64 * 0.1, i as f64 + 2.0, i as f64 * 6.5)
            })
            .collect();
        OrderbookSlice {
            bids,
            asks,
            spread: 0.5,
            spread_percent: 0.0000051282,
            midpoint: 97500.25,
            timestamp_ms: 1_700_000_000_123.25,
            last_update_id: 987654321,
        }
    }

    #[test]
    fn encode_decode_round_trip_is_bit_exact() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(region);

        let slice = full_slice();
        writer.write(&slice);

        let decoded = reader.poll().expect("version moved");
        assert_eq!(decoded, slice);
        assert_eq!(reader.observed_version(), 1);

        // Second write bumps to version 2.
        writer.write(&slice);
        assert!(reader.poll().is_some());
        assert_eq!(reader.observed_version(), 2);
    }

    #[test]
    fn unchanged_version_polls_nothing() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(region);

        assert!(reader.poll().is_none());
        writer.write(&full_slice());
        assert!(reader.poll().is_some());
        assert!(reader.poll().is_none());
    }

    #[test]
    fn oversized_counts_are_clamped_on_read() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        writer.write(&full_slice());

        // Corrupt the counts beyond the table size.
        region.store_u32(OFF_BID_COUNT, 40);
        region.store_u32(OFF_ASK_COUNT, 1000);
        region.bump_version();

        let mut reader = SliceReader::new(region);
        let decoded = reader.poll().unwrap();
        assert_eq!(decoded.bids.len(), MAX_LEVELS);
        assert_eq!(decoded.asks.len(), MAX_LEVELS);
    }

    #[test]
    fn empty_sides_round_trip() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(region);

        let slice = OrderbookSlice {
            timestamp_ms: 42.0,
            ..Default::default()
        };
        writer.write(&slice);
        let decoded = reader.poll().unwrap();
        assert_eq!(decoded, slice);
    }

    #[test]
    fn skip_advances_version_without_decoding() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(region);

        writer.write(&full_slice());
        assert!(reader.skip());
        assert_eq!(reader.observed_version(), 1);
        // Already observed; nothing new to poll.
        assert!(reader.poll().is_none());
        assert!(!reader.skip());
    }

    #[test]
    fn nan_payloads_survive_bit_exact() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(region);

        let mut slice = full_slice();
        slice.spread = f64::NAN;
        writer.write(&slice);

        let decoded = reader.poll().unwrap();
        assert_eq!(decoded.spread.to_bits(), slice.spread.to_bits());
    }

    #[test]
    fn writer_cross_thread_visibility() {
        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));
        let mut reader = SliceReader::new(Arc::clone(&region));

        let slice = full_slice();
        let expected = slice.clone();
        let handle = std::thread::spawn(move || writer.write(&slice));
        handle.join().unwrap();

        let decoded = reader.poll().unwrap();
        assert_eq!(decoded, expected);
    }
}
