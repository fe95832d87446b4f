//! Sequence synchronization against the exchange.
//!
//! Incoming deltas are buffered until a REST snapshot anchors the book,
//! then validated against the running sequence. The aggregated stream
//! routinely skips ids, so small gaps (up to [`GAP_TOLERANCE`]) are
//! accepted; anything larger forces a resync through a fresh snapshot.
//!
//! State machine:
//! `buffering → syncing → synchronized → (resync → buffering → ...)*`

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::book::BookEngine;
use crate::data::{DepthSnapshot, RawDelta};

/// Maximum acceptable skip in `first_update_id` without a resync.
///
/// Strict enforcement against the aggregated stream causes
/// fetch-amplification and rate-limiting; tolerated gaps are counted
/// but accepted.
pub const GAP_TOLERANCE: u64 = 1000;

/// Upper bound on buffered deltas while waiting for a snapshot.
pub const MAX_BUFFERED_DELTAS: usize = 4096;

/// Total snapshot fetch attempts allowed per sync session, regardless of
/// whether an attempt failed over HTTP or returned a too-old snapshot.
pub const MAX_SNAPSHOT_ATTEMPTS: u32 = 3;

/// Synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Collecting deltas; no snapshot requested yet.
    Buffering,
    /// Snapshot fetch in flight; deltas keep buffering.
    Syncing,
    /// Normal operation; deltas are validated and forwarded to the book.
    Synchronized,
}

/// What happened to a delta handed to [`SequenceManager::on_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Buffered. When `request_snapshot` is set the host must start a
    /// snapshot fetch (this was the first delta of the session).
    Buffered { request_snapshot: bool },
    /// Validated and applied to the book.
    Applied,
    /// Gap beyond tolerance: state was reset, the delta re-entered the
    /// buffer, and a new snapshot fetch must start.
    Resync { gap: u64 },
}

/// Result of feeding a fetched snapshot to [`SequenceManager::on_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot applied and buffered tail replayed; now synchronized.
    Applied { replayed: usize },
    /// Snapshot predates the earliest buffered delta. When `refetch` is
    /// set the attempt budget allows another fetch.
    TooOld { refetch: bool },
    /// Arrived outside the syncing state (e.g. after a reset aborted the
    /// fetch); dropped.
    Ignored,
}

/// Buffers, reconciles, and validates the delta sequence.
#[derive(Debug)]
pub struct SequenceManager {
    state: SyncState,
    buffer: VecDeque<RawDelta>,
    last_update_id: u64,
    gap_tolerance: u64,
    snapshot_attempts: u32,
    sequence_gaps: u64,
    buffer_overflows: u64,
}

impl SequenceManager {
    pub fn new() -> Self {
        Self::with_gap_tolerance(GAP_TOLERANCE)
    }

    pub fn with_gap_tolerance(gap_tolerance: u64) -> Self {
        Self {
            state: SyncState::Buffering,
            buffer: VecDeque::new(),
            last_update_id: 0,
            gap_tolerance,
            snapshot_attempts: 0,
            sequence_gaps: 0,
            buffer_overflows: 0,
        }
    }

    /// Feed one inbound delta.
    pub fn on_delta(&mut self, delta: RawDelta, book: &mut BookEngine) -> DeltaOutcome {
        match self.state {
            SyncState::Buffering | SyncState::Syncing => self.buffer_delta(delta),
            SyncState::Synchronized => self.validate_delta(delta, book),
        }
    }

    fn buffer_delta(&mut self, delta: RawDelta) -> DeltaOutcome {
        if self.buffer.len() >= MAX_BUFFERED_DELTAS {
            self.buffer.pop_front();
            self.buffer_overflows += 1;
            warn!(
                dropped = self.buffer_overflows,
                "delta buffer full, dropping oldest"
            );
        }
        self.buffer.push_back(delta);

        let request_snapshot = self.state == SyncState::Buffering;
        if request_snapshot {
            self.state = SyncState::Syncing;
            self.snapshot_attempts += 1;
        }
        DeltaOutcome::Buffered { request_snapshot }
    }

    fn validate_delta(&mut self, delta: RawDelta, book: &mut BookEngine) -> DeltaOutcome {
        let first = delta.first_update_id;
        let last = delta.final_update_id;

        if first <= self.last_update_id + 1 {
            // Contiguous or overlapping.
            book.apply_delta(&delta);
            self.last_update_id = last;
            return DeltaOutcome::Applied;
        }

        let gap = first - (self.last_update_id + 1);
        self.sequence_gaps += 1;

        if gap <= self.gap_tolerance {
            debug!(gap, first, last, "tolerated sequence gap");
            book.apply_delta(&delta);
            self.last_update_id = last;
            return DeltaOutcome::Applied;
        }

        warn!(
            gap,
            expected = self.last_update_id + 1,
            received = first,
            "sequence gap beyond tolerance, resyncing"
        );
        self.reset();
        // The offending delta re-enters as the first buffering event,
        // which also requests the fresh snapshot.
        self.buffer_delta(delta);
        DeltaOutcome::Resync { gap }
    }

    /// Reconcile a fetched snapshot with the buffered deltas.
    ///
    /// Drops every buffered delta fully covered by the snapshot
    /// (`final_update_id <= snapshot.last_update_id`), applies the
    /// snapshot, replays the tail in order, and transitions to
    /// synchronized.
    pub fn on_snapshot(
        &mut self,
        snapshot: &DepthSnapshot,
        book: &mut BookEngine,
    ) -> SnapshotOutcome {
        if self.state != SyncState::Syncing {
            return SnapshotOutcome::Ignored;
        }

        if let Some(first) = self.buffer.front() {
            if snapshot.last_update_id < first.first_update_id {
                let refetch = self.snapshot_attempts < MAX_SNAPSHOT_ATTEMPTS;
                warn!(
                    snapshot_id = snapshot.last_update_id,
                    earliest_buffered = first.first_update_id,
                    refetch,
                    "snapshot older than earliest buffered delta"
                );
                if refetch {
                    self.snapshot_attempts += 1;
                }
                return SnapshotOutcome::TooOld { refetch };
            }
        }

        while let Some(front) = self.buffer.front() {
            if front.final_update_id <= snapshot.last_update_id {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        book.apply_snapshot(snapshot);
        self.last_update_id = snapshot.last_update_id;

        let replayed = self.buffer.len();
        for delta in self.buffer.drain(..) {
            book.apply_delta(&delta);
            self.last_update_id = delta.final_update_id;
        }

        self.state = SyncState::Synchronized;
        self.snapshot_attempts = 0;
        info!(
            last_update_id = self.last_update_id,
            replayed, "snapshot reconciled, synchronized"
        );
        SnapshotOutcome::Applied { replayed }
    }

    /// Record a failed fetch attempt. Returns `true` when the budget
    /// allows another attempt; otherwise the session stays in syncing
    /// until a reset starts a fresh one.
    pub fn on_fetch_failed(&mut self) -> bool {
        if self.state != SyncState::Syncing {
            return false;
        }
        if self.snapshot_attempts < MAX_SNAPSHOT_ATTEMPTS {
            self.snapshot_attempts += 1;
            true
        } else {
            warn!(
                attempts = self.snapshot_attempts,
                "snapshot attempt budget exhausted, staying in syncing"
            );
            false
        }
    }

    /// Abandon the current session: clear the buffer, zero the sequence,
    /// return to buffering. Any in-flight fetch must be aborted by the
    /// caller; a result that slips through is ignored.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_update_id = 0;
        self.state = SyncState::Buffering;
        self.snapshot_attempts = 0;
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Count of gaps seen (tolerated and resync-inducing alike).
    pub fn sequence_gaps(&self) -> u64 {
        self.sequence_gaps
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(first: u64, last: u64) -> RawDelta {
        RawDelta {
            event_type: "depthUpdate".into(),
            event_time_ms: 0,
            symbol: "BTCUSD".into(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![[format!("{}.0", 100 + first % 50), "1.0".into()]],
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: vec![["100.0".into(), "1.0".into()]],
            asks: vec![["101.0".into(), "1.0".into()]],
        }
    }

    fn synchronized_at(id: u64) -> (SequenceManager, BookEngine) {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);
        sm.on_delta(delta(id, id), &mut book);
        let outcome = sm.on_snapshot(&snapshot(id), &mut book);
        assert!(matches!(outcome, SnapshotOutcome::Applied { .. }));
        assert_eq!(sm.state(), SyncState::Synchronized);
        (sm, book)
    }

    #[test]
    fn first_delta_requests_snapshot_and_enters_syncing() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        let outcome = sm.on_delta(delta(100, 102), &mut book);
        assert_eq!(
            outcome,
            DeltaOutcome::Buffered {
                request_snapshot: true
            }
        );
        assert_eq!(sm.state(), SyncState::Syncing);

        let outcome = sm.on_delta(delta(103, 105), &mut book);
        assert_eq!(
            outcome,
            DeltaOutcome::Buffered {
                request_snapshot: false
            }
        );
        assert_eq!(sm.buffered(), 2);
    }

    #[test]
    fn snapshot_reconciliation_drops_covered_deltas_and_replays_tail() {
        // D1 (100,102), D2 (103,105), D3 (106,108); snapshot at 104.
        // D1 is fully covered (u <= 104) and dropped; D2 straddles the
        // snapshot and replays along with D3; final id is 108.
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(100, 102), &mut book);
        sm.on_delta(delta(103, 105), &mut book);
        sm.on_delta(delta(106, 108), &mut book);

        let outcome = sm.on_snapshot(&snapshot(104), &mut book);
        assert_eq!(outcome, SnapshotOutcome::Applied { replayed: 2 });
        assert_eq!(sm.state(), SyncState::Synchronized);
        assert_eq!(sm.last_update_id(), 108);
        assert_eq!(book.last_update_id(), 108);
        assert_eq!(sm.buffered(), 0);
    }

    #[test]
    fn small_gap_is_tolerated() {
        let (mut sm, mut book) = synchronized_at(1003);

        // gap = 1504 - (1003 + 1) = 500 <= 1000
        let outcome = sm.on_delta(delta(1504, 1506), &mut book);
        assert_eq!(outcome, DeltaOutcome::Applied);
        assert_eq!(sm.last_update_id(), 1506);
        assert_eq!(sm.state(), SyncState::Synchronized);
        assert_eq!(sm.sequence_gaps(), 1);
    }

    #[test]
    fn large_gap_triggers_resync_and_rebuffers_delta() {
        let (mut sm, mut book) = synchronized_at(1003);

        // gap = 3005 - (1003 + 1) = 2001 > 1000
        let outcome = sm.on_delta(delta(3005, 3007), &mut book);
        assert_eq!(outcome, DeltaOutcome::Resync { gap: 2001 });
        assert_eq!(sm.state(), SyncState::Syncing);
        assert_eq!(sm.buffered(), 1);
        assert_eq!(sm.last_update_id(), 0);
        assert_eq!(sm.sequence_gaps(), 1);
    }

    #[test]
    fn contiguous_and_overlapping_deltas_are_accepted() {
        let (mut sm, mut book) = synchronized_at(100);

        assert_eq!(sm.on_delta(delta(101, 103), &mut book), DeltaOutcome::Applied);
        // Overlapping: first <= last_update_id + 1.
        assert_eq!(sm.on_delta(delta(102, 105), &mut book), DeltaOutcome::Applied);
        assert_eq!(sm.last_update_id(), 105);
        assert_eq!(sm.sequence_gaps(), 0);
    }

    #[test]
    fn too_old_snapshot_requests_refetch_up_to_cap() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(500, 502), &mut book); // attempt 1 requested

        // Attempt 2.
        let outcome = sm.on_snapshot(&snapshot(400), &mut book);
        assert_eq!(outcome, SnapshotOutcome::TooOld { refetch: true });
        // Attempt 3.
        let outcome = sm.on_snapshot(&snapshot(401), &mut book);
        assert_eq!(outcome, SnapshotOutcome::TooOld { refetch: true });
        // Budget exhausted.
        let outcome = sm.on_snapshot(&snapshot(402), &mut book);
        assert_eq!(outcome, SnapshotOutcome::TooOld { refetch: false });
        assert_eq!(sm.state(), SyncState::Syncing);
    }

    #[test]
    fn fetch_failure_budget_matches_attempt_cap() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(1, 1), &mut book); // attempt 1
        assert!(sm.on_fetch_failed()); // attempt 2
        assert!(sm.on_fetch_failed()); // attempt 3
        assert!(!sm.on_fetch_failed()); // exhausted
        assert_eq!(sm.state(), SyncState::Syncing);
    }

    #[test]
    fn snapshot_outside_syncing_is_ignored() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);
        assert_eq!(
            sm.on_snapshot(&snapshot(10), &mut book),
            SnapshotOutcome::Ignored
        );

        let (mut sm, mut book) = synchronized_at(100);
        assert_eq!(
            sm.on_snapshot(&snapshot(200), &mut book),
            SnapshotOutcome::Ignored
        );
    }

    #[test]
    fn reset_returns_to_buffering_with_fresh_budget() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        sm.on_delta(delta(1, 1), &mut book);
        sm.on_fetch_failed();
        sm.reset();

        assert_eq!(sm.state(), SyncState::Buffering);
        assert_eq!(sm.buffered(), 0);
        assert_eq!(sm.last_update_id(), 0);

        // A new session gets a full attempt budget.
        let outcome = sm.on_delta(delta(5, 5), &mut book);
        assert_eq!(
            outcome,
            DeltaOutcome::Buffered {
                request_snapshot: true
            }
        );
        assert!(sm.on_fetch_failed());
        assert!(sm.on_fetch_failed());
        assert!(!sm.on_fetch_failed());
    }

    #[test]
    fn buffer_is_bounded() {
        let mut sm = SequenceManager::new();
        let mut book = BookEngine::new(15);

        for i in 0..(MAX_BUFFERED_DELTAS as u64 + 10) {
            sm.on_delta(delta(i, i), &mut book);
        }
        assert_eq!(sm.buffered(), MAX_BUFFERED_DELTAS);
    }

    #[test]
    fn resync_session_recovers_through_new_snapshot() {
        let (mut sm, mut book) = synchronized_at(1003);

        sm.on_delta(delta(3005, 3007), &mut book);
        assert_eq!(sm.state(), SyncState::Syncing);

        // Fresh snapshot covering the rebuffered delta.
        let outcome = sm.on_snapshot(&snapshot(3005), &mut book);
        assert_eq!(outcome, SnapshotOutcome::Applied { replayed: 1 });
        assert_eq!(sm.last_update_id(), 3007);
        assert_eq!(sm.state(), SyncState::Synchronized);
    }
}
