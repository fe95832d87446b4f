//! Process-local reactive state container.
//!
//! Holds the latest live slice, an optional frozen snapshot, connection
//! status, leadership flag, sync-mode tag, and metrics. Each field has its
//! own `tokio::sync::watch` channel so a subscriber to one field is only
//! woken when that field actually changes; equality-gated sends keep
//! spurious notifications out.
//!
//! Freeze semantics: `freeze()` captures the current live slice; while the
//! flag is set, readers of [`ReactiveStore::displayed_slice`] see the
//! frozen slice and live updates continue silently underneath.

use std::sync::Arc;

use tokio::sync::watch;

use crate::data::{ConnectionStatus, Metrics, MetricsPatch, OrderbookSlice, SyncMode};

struct Inner {
    live: watch::Sender<Option<Arc<OrderbookSlice>>>,
    frozen_slice: watch::Sender<Option<Arc<OrderbookSlice>>>,
    frozen: watch::Sender<bool>,
    status: watch::Sender<ConnectionStatus>,
    error: watch::Sender<Option<String>>,
    metrics: watch::Sender<Metrics>,
    is_leader: watch::Sender<bool>,
    sync_mode: watch::Sender<SyncMode>,
}

/// Shared handle to the store; clones observe the same state.
#[derive(Clone)]
pub struct ReactiveStore {
    inner: Arc<Inner>,
}

impl ReactiveStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                live: watch::channel(None).0,
                frozen_slice: watch::channel(None).0,
                frozen: watch::channel(false).0,
                status: watch::channel(ConnectionStatus::Disconnected).0,
                error: watch::channel(None).0,
                metrics: watch::channel(Metrics::default()).0,
                is_leader: watch::channel(false).0,
                sync_mode: watch::channel(SyncMode::default()).0,
            }),
        }
    }

    // ---- actions ----

    /// Replace the live slice. Every published slice is a new value, so
    /// subscribers are always notified.
    pub fn update_live(&self, slice: Arc<OrderbookSlice>) {
        let _ = self.inner.live.send_replace(Some(slice));
    }

    /// Capture the current live slice as the frozen snapshot.
    pub fn freeze(&self) {
        let live = self.inner.live.borrow().clone();
        self.inner.frozen_slice.send_if_modified(|f| {
            let changed = !same_slice(f, &live);
            *f = live.clone();
            changed
        });
        self.inner.frozen.send_if_modified(|f| {
            let changed = !*f;
            *f = true;
            changed
        });
    }

    /// Drop the frozen snapshot and resume showing live data.
    pub fn unfreeze(&self) {
        self.inner.frozen_slice.send_if_modified(|f| {
            let changed = f.is_some();
            *f = None;
            changed
        });
        self.inner.frozen.send_if_modified(|f| {
            let changed = *f;
            *f = false;
            changed
        });
    }

    /// Update connection status (and the optional error message).
    pub fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        self.inner.status.send_if_modified(|s| {
            if *s == status {
                false
            } else {
                *s = status.clone();
                true
            }
        });
        self.inner.error.send_if_modified(|e| {
            if *e == error {
                false
            } else {
                *e = error.clone();
                true
            }
        });
    }

    /// Merge a partial metrics frame.
    pub fn update_metrics(&self, patch: &MetricsPatch) {
        self.inner.metrics.send_if_modified(|m| {
            let before = m.clone();
            patch.apply(m);
            *m != before
        });
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.inner.is_leader.send_if_modified(|l| {
            let changed = *l != is_leader;
            *l = is_leader;
            changed
        });
    }

    pub fn set_sync_mode(&self, mode: SyncMode) {
        self.inner.sync_mode.send_if_modified(|m| {
            let changed = *m != mode;
            *m = mode;
            changed
        });
    }

    // ---- reads ----

    pub fn live_slice(&self) -> Option<Arc<OrderbookSlice>> {
        self.inner.live.borrow().clone()
    }

    pub fn frozen_slice(&self) -> Option<Arc<OrderbookSlice>> {
        self.inner.frozen_slice.borrow().clone()
    }

    pub fn is_frozen(&self) -> bool {
        *self.inner.frozen.borrow()
    }

    /// The slice external readers should display: frozen wins while the
    /// flag is set, live otherwise.
    pub fn displayed_slice(&self) -> Option<Arc<OrderbookSlice>> {
        if self.is_frozen() {
            self.frozen_slice()
        } else {
            self.live_slice()
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.error.borrow().clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.metrics.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.is_leader.borrow()
    }

    pub fn sync_mode(&self) -> SyncMode {
        *self.inner.sync_mode.borrow()
    }

    // ---- subscriptions ----

    pub fn subscribe_live(&self) -> watch::Receiver<Option<Arc<OrderbookSlice>>> {
        self.inner.live.subscribe()
    }

    pub fn subscribe_frozen(&self) -> watch::Receiver<bool> {
        self.inner.frozen.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<Metrics> {
        self.inner.metrics.subscribe()
    }

    pub fn subscribe_leader(&self) -> watch::Receiver<bool> {
        self.inner.is_leader.subscribe()
    }

    pub fn subscribe_sync_mode(&self) -> watch::Receiver<SyncMode> {
        self.inner.sync_mode.subscribe()
    }
}

impl Default for ReactiveStore {
    fn default() -> Self {
        Self::new()
    }
}

fn same_slice(a: &Option<Arc<OrderbookSlice>>, b: &Option<Arc<OrderbookSlice>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
