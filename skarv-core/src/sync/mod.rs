//! Snapshot/delta sequence synchronization.

pub mod sequence;
pub mod snapshot;

pub use sequence::{
    DeltaOutcome, SequenceManager, SnapshotOutcome, SyncState, GAP_TOLERANCE,
    MAX_BUFFERED_DELTAS, MAX_SNAPSHOT_ATTEMPTS,
};
pub use snapshot::{SnapshotFetcher, SNAPSHOT_RETRY_DELAY, SNAPSHOT_TIMEOUT};
