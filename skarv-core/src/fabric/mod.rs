//! Distribution fabrics: how slices reach consumers.
//!
//! Three interchangeable variants sit behind the [`SlicePublisher`] seam:
//! a shared host fanning out to attached ports, a leader-elected consumer
//! rebroadcasting over a bus, and a single-writer shared-memory region.

pub mod election;
pub mod leader;
pub mod session;
pub mod shared_host;
pub mod shared_memory;

use tokio::sync::mpsc;

use crate::data::{now_ms, ConnectionStatus, MetricsPatch, OrderbookSlice, ProducerEvent};

pub use election::{ElectionCell, FileCell, LeaseRecord, MemoryCell};
pub use leader::{LeaderFabric, LeaderFabricConfig, LeaderFabricHandle};
pub use session::{random_tab_id, Session};
pub use shared_host::{SharedHost, SharedHostConfig, SharedHostHandle, SharedHostPort};
pub use shared_memory::{SliceReader, SliceRegion, SliceWriter, MAX_LEVELS, REGION_SIZE};

/// Builds (and connects) a producer host, publishing into the given event
/// channel. Shared by the host and leader fabrics so tests can substitute
/// a scripted producer.
pub type ProducerFactory = Box<
    dyn FnMut(mpsc::UnboundedSender<ProducerEvent>) -> crate::producer::ProducerHandle + Send,
>;

/// Producer-side seam every fabric variant implements.
///
/// The producer host publishes through this without knowing which fabric
/// carries the data.
pub trait SlicePublisher: Send {
    /// A fresh slice at the publish cadence.
    fn publish_slice(&mut self, slice: OrderbookSlice);
    /// A status transition (sent immediately, never coalesced).
    fn publish_status(&mut self, status: ConnectionStatus, error: Option<String>);
    /// A partial metrics frame.
    fn publish_metrics(&mut self, patch: MetricsPatch);
}

/// Publisher that forwards everything as [`ProducerEvent`]s over a channel.
///
/// Used directly by the shared host (which fans events out to its ports)
/// and by the leader fabric (which pumps them onto the bus).
#[derive(Debug, Clone)]
pub struct EventPublisher {
    events: mpsc::UnboundedSender<ProducerEvent>,
}

impl EventPublisher {
    pub fn new(events: mpsc::UnboundedSender<ProducerEvent>) -> Self {
        Self { events }
    }
}

impl SlicePublisher for EventPublisher {
    fn publish_slice(&mut self, slice: OrderbookSlice) {
        let _ = self.events.send(ProducerEvent::OrderbookUpdate {
            data: slice,
            producer_timestamp_ms: now_ms(),
        });
    }

    fn publish_status(&mut self, status: ConnectionStatus, error: Option<String>) {
        let _ = self
            .events
            .send(ProducerEvent::StatusChange { status, error });
    }

    fn publish_metrics(&mut self, patch: MetricsPatch) {
        let _ = self.events.send(ProducerEvent::Metrics { data: patch });
    }
}

/// Publisher that encodes slices into a shared-memory region and forwards
/// everything else over the control channel.
#[derive(Debug, Clone)]
pub struct ShmPublisher {
    writer: SliceWriter,
    events: mpsc::UnboundedSender<ProducerEvent>,
}

impl ShmPublisher {
    /// Create the publisher and announce the region handle once.
    pub fn new(writer: SliceWriter, events: mpsc::UnboundedSender<ProducerEvent>) -> Self {
        let _ = events.send(ProducerEvent::SharedMemoryReady {
            handle: writer.region(),
        });
        Self { writer, events }
    }
}

impl SlicePublisher for ShmPublisher {
    fn publish_slice(&mut self, slice: OrderbookSlice) {
        self.writer.write(&slice);
    }

    fn publish_status(&mut self, status: ConnectionStatus, error: Option<String>) {
        let _ = self
            .events
            .send(ProducerEvent::StatusChange { status, error });
    }

    fn publish_metrics(&mut self, patch: MetricsPatch) {
        let _ = self.events.send(ProducerEvent::Metrics { data: patch });
    }
}
