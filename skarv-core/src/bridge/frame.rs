//! Frame-synchronized consumer bridge.
//!
//! Coalesces an arbitrarily fast inbound slice stream into at most one
//! store update per display frame and keeps the derived metrics current.
//! All timing uses one local monotonic clock, so latency samples are
//! always non-negative.
//!
//! FPS is the averaged variant: `round(frame_count × 1000 / elapsed)`
//! over each metrics window, not the instantaneous `1000 / frame_delta`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::bridge::latency::LatencyWindow;
use crate::data::{MetricsPatch, OrderbookSlice, ProducerEvent};
use crate::fabric::{SliceReader, SliceRegion};
use crate::store::ReactiveStore;

/// Nominal frame duration at the 60 Hz display cadence.
pub const FRAME_INTERVAL_MS: f64 = 16.67;

/// Metrics publish period.
pub const METRICS_INTERVAL_MS: f64 = 1000.0;

/// Per-consumer bridge between a fabric and the reactive store.
pub struct FrameBridge {
    store: ReactiveStore,
    /// Monotonic base for all `f64` millisecond stamps.
    epoch: Instant,
    /// Latest inbound slice and its receive stamp.
    latest: Option<(Arc<OrderbookSlice>, f64)>,
    dirty: bool,
    last_frame: Option<f64>,
    latency: LatencyWindow,
    frame_count: u32,
    message_count: u32,
    dropped_frames: u64,
    last_metrics_at: Option<f64>,
    hidden: bool,
    /// Reader for the shared-memory fabric, attached on handshake.
    shm: Option<SliceReader>,
}

impl FrameBridge {
    pub fn new(store: ReactiveStore) -> Self {
        Self {
            store,
            epoch: Instant::now(),
            latest: None,
            dirty: false,
            last_frame: None,
            latency: LatencyWindow::new(),
            frame_count: 0,
            message_count: 0,
            dropped_frames: 0,
            last_metrics_at: None,
            hidden: false,
            shm: None,
        }
    }

    /// Milliseconds on the bridge's monotonic clock.
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Attach the shared-memory region (from the `shared_memory_ready`
    /// handshake); subsequent frames poll it.
    pub fn attach_region(&mut self, region: Arc<SliceRegion>) {
        debug!("shared-memory region attached");
        self.shm = Some(SliceReader::new(region));
    }

    /// Route one inbound fabric event.
    pub fn on_event(&mut self, event: ProducerEvent) {
        match event {
            ProducerEvent::OrderbookUpdate { data, .. } => {
                self.on_slice(Arc::new(data));
            }
            ProducerEvent::StatusChange { status, error } => {
                self.store.set_status(status, error);
            }
            ProducerEvent::Metrics { data } => {
                self.store.update_metrics(&data);
            }
            ProducerEvent::SharedMemoryReady { handle } => {
                self.attach_region(handle);
            }
        }
    }

    /// Record an inbound slice; the store is updated on the next frame.
    pub fn on_slice(&mut self, slice: Arc<OrderbookSlice>) {
        let now = self.now_ms();
        self.latest = Some((slice, now));
        self.dirty = true;
        self.message_count += 1;
    }

    /// One display frame at the current clock.
    pub fn on_frame(&mut self) {
        let now = self.now_ms();
        self.on_frame_at(now);
    }

    /// One display frame at an explicit clock reading (exercised directly
    /// in tests; `on_frame` is the production entry point).
    pub fn on_frame_at(&mut self, now: f64) {
        // Frame-delta bookkeeping and missed-frame accounting.
        if let Some(last) = self.last_frame {
            let frame_delta = now - last;
            let missed = ((frame_delta / FRAME_INTERVAL_MS).floor() as i64 - 1).max(0) as u64;
            if !self.hidden {
                self.dropped_frames += missed;
            }
        }
        self.last_frame = Some(now);
        self.frame_count += 1;

        // Shared-memory variant: poll the version counter. While frozen,
        // only advance it — decoding would clobber the pooled levels the
        // frozen view still references.
        if let Some(reader) = &mut self.shm {
            if self.store.is_frozen() {
                reader.skip();
            } else if let Some(slice) = reader.poll() {
                self.latest = Some((Arc::new(slice), now));
                self.dirty = true;
                self.message_count += 1;
            }
        }

        // At most one store update per frame.
        if self.dirty {
            if let Some((slice, received_at)) = &self.latest {
                self.latency.record(now - received_at);
                self.store.update_live(Arc::clone(slice));
            }
            self.dirty = false;
        }

        // Periodic metrics publish.
        let metrics_due = match self.last_metrics_at {
            Some(last) => now - last >= METRICS_INTERVAL_MS,
            None => {
                self.last_metrics_at = Some(now);
                false
            }
        };
        if metrics_due {
            let elapsed = now - self.last_metrics_at.unwrap_or(now);
            self.publish_metrics(elapsed);
            self.last_metrics_at = Some(now);
        }
    }

    fn publish_metrics(&mut self, elapsed_ms: f64) {
        if elapsed_ms <= 0.0 {
            return;
        }
        let fps = (self.frame_count as f64 * 1000.0 / elapsed_ms).round() as u32;
        let messages_per_second =
            (self.message_count as f64 * 1000.0 / elapsed_ms * 10.0).round() / 10.0;

        self.store.update_metrics(&MetricsPatch {
            messages_per_second: Some(messages_per_second),
            latency: Some(self.latency.stats()),
            fps: Some(fps),
            dropped_frames: Some(self.dropped_frames),
            ..Default::default()
        });

        self.frame_count = 0;
        self.message_count = 0;
    }

    /// Visibility signal from the platform.
    ///
    /// Going hidden (and resuming) resets the rolling timestamps so the
    /// backgrounded interval neither counts as dropped frames nor shows
    /// up as pseudo-latency on the pending slice.
    pub fn set_hidden(&mut self, hidden: bool) {
        if self.hidden == hidden {
            return;
        }
        self.hidden = hidden;
        self.last_frame = None;
        self.last_metrics_at = None;
        self.frame_count = 0;
        self.message_count = 0;
        if !hidden {
            let now = self.now_ms();
            if let Some((_, received_at)) = &mut self.latest {
                *received_at = now;
            }
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn store(&self) -> &ReactiveStore {
        &self.store
    }

    /// Drive the bridge from an event channel at the display cadence
    /// until the channel closes or `shutdown` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ProducerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut frame = tokio::time::interval(Duration::from_micros(16_670));
        frame.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => return,
                },
                _ = frame.tick() => self.on_frame(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ConnectionStatus;

    fn slice(id: u64) -> Arc<OrderbookSlice> {
        Arc::new(OrderbookSlice {
            last_update_id: id,
            ..Default::default()
        })
    }

    fn bridge() -> FrameBridge {
        FrameBridge::new(ReactiveStore::new())
    }

    #[test]
    fn one_store_update_per_frame() {
        let mut fb = bridge();

        // Three slices inside one frame: only the newest lands.
        fb.on_slice(slice(1));
        fb.on_slice(slice(2));
        fb.on_slice(slice(3));
        fb.on_frame_at(16.67);

        assert_eq!(fb.store().live_slice().unwrap().last_update_id, 3);

        // No new slice: the next frame does not touch the store.
        let mut rx = fb.store().subscribe_live();
        let _ = rx.borrow_and_update();
        fb.on_frame_at(33.34);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn missed_frames_are_counted() {
        let mut fb = bridge();
        fb.on_frame_at(0.0);
        // 5 frame intervals elapsed → 4 missed.
        fb.on_frame_at(5.0 * FRAME_INTERVAL_MS);
        assert_eq!(fb.dropped_frames(), 4);

        // A normal-cadence frame adds none.
        fb.on_frame_at(6.0 * FRAME_INTERVAL_MS);
        assert_eq!(fb.dropped_frames(), 4);
    }

    #[test]
    fn hidden_frames_do_not_count_as_dropped() {
        let mut fb = bridge();
        fb.on_frame_at(0.0);
        fb.set_hidden(true);
        fb.on_frame_at(1000.0);
        assert_eq!(fb.dropped_frames(), 0);

        // Resume: the gap while hidden never registers.
        fb.set_hidden(false);
        fb.on_frame();
        assert_eq!(fb.dropped_frames(), 0);
    }

    #[test]
    fn latency_is_non_negative_and_recorded() {
        let mut fb = bridge();
        fb.on_slice(slice(1));
        fb.on_frame();
        let stats = fb.latency.stats();
        assert!(stats.current_ms >= 0.0);
        assert_eq!(fb.latency.sample_count(), 1);
    }

    #[test]
    fn metrics_publish_after_one_second_of_frames() {
        let mut fb = bridge();
        let mut now = 0.0;
        // ~61 frames over ~1.02 s.
        for _ in 0..62 {
            fb.on_frame_at(now);
            now += FRAME_INTERVAL_MS;
        }
        let metrics = fb.store().metrics();
        assert!(metrics.fps >= 59 && metrics.fps <= 61, "fps = {}", metrics.fps);
    }

    #[test]
    fn status_and_metrics_events_route_to_store() {
        let mut fb = bridge();
        fb.on_event(ProducerEvent::StatusChange {
            status: ConnectionStatus::Connected,
            error: None,
        });
        assert_eq!(fb.store().status(), ConnectionStatus::Connected);

        fb.on_event(ProducerEvent::Metrics {
            data: MetricsPatch::tab_count(3),
        });
        assert_eq!(fb.store().metrics().tab_count, 3);
    }

    #[test]
    fn frozen_store_skips_shm_decode_but_advances_version() {
        use crate::fabric::{SliceRegion, SliceWriter};

        let region = SliceRegion::new();
        let writer = SliceWriter::new(Arc::clone(&region));

        let mut fb = bridge();
        fb.attach_region(Arc::clone(&region));

        // First write lands normally.
        writer.write(&OrderbookSlice {
            last_update_id: 1,
            ..Default::default()
        });
        fb.on_frame_at(16.67);
        assert_eq!(fb.store().live_slice().unwrap().last_update_id, 1);

        // Freeze, then write again: version advances, store does not.
        fb.store().freeze();
        writer.write(&OrderbookSlice {
            last_update_id: 2,
            ..Default::default()
        });
        fb.on_frame_at(33.34);
        assert_eq!(fb.store().live_slice().unwrap().last_update_id, 1);
        assert_eq!(fb.shm.as_ref().unwrap().observed_version(), 2);

        // Unfreeze: nothing pending (version already observed); the next
        // write decodes again.
        fb.store().unfreeze();
        writer.write(&OrderbookSlice {
            last_update_id: 3,
            ..Default::default()
        });
        fb.on_frame_at(50.01);
        assert_eq!(fb.store().live_slice().unwrap().last_update_id, 3);
    }

    #[test]
    fn resume_restamps_pending_slice() {
        let mut fb = bridge();
        fb.on_slice(slice(1));
        fb.set_hidden(true);
        fb.set_hidden(false);
        fb.on_frame();
        // Latency measured from the resume stamp, not the original
        // receive time.
        assert!(fb.latency.stats().current_ms < 1000.0);
    }
}
