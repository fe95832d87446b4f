//! Control-message schema between consumers, producer hosts, and fabrics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::{ConnectionStatus, MetricsPatch, OrderbookSlice};
use crate::fabric::shared_memory::SliceRegion;

/// Consumer → producer control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerControl {
    /// Start (or restart) a feed session against the given endpoints.
    Connect {
        symbol: String,
        ws_url: String,
        rest_url: String,
        stream_suffix: String,
    },
    /// Tear the session down; suppresses pending reconnects.
    Disconnect,
    /// Liveness refresh.
    Ping,
    /// Visibility change of the consumer context.
    Visibility { hidden: bool },
    /// Change the number of levels per side in future slices.
    SetDepth { depth: u32 },
}

/// Producer → consumer events.
///
/// Not serialized: the shared-memory variant carries an in-process region
/// handle. The leader bus wraps the serializable subset separately.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    /// A fresh slice, stamped with the producer's wall clock.
    OrderbookUpdate {
        data: OrderbookSlice,
        producer_timestamp_ms: f64,
    },
    /// Connection status transition.
    StatusChange {
        status: ConnectionStatus,
        error: Option<String>,
    },
    /// Partial metrics frame (e.g. tab count on membership change).
    Metrics { data: MetricsPatch },
    /// One-time handle transfer for the shared-memory fabric.
    SharedMemoryReady { handle: Arc<SliceRegion> },
}

/// Messages on the leader-replicated broadcast bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Leader → all: a slice or status payload.
    Data { payload: BusPayload },
    /// Leader → all: current number of live consumers.
    TabCount { count: usize },
    /// Follower → leader: presence ping.
    TabPing { tab_id: String },
}

/// Payload carried by [`BusMessage::Data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusPayload {
    OrderbookUpdate {
        data: OrderbookSlice,
        producer_timestamp_ms: f64,
    },
    StatusChange {
        status: ConnectionStatus,
        error: Option<String>,
    },
    Metrics {
        data: MetricsPatch,
    },
}
