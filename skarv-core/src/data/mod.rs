//! Data model and control-message schema.

pub mod messages;
pub mod types;

pub use messages::{BusMessage, BusPayload, ConsumerControl, ProducerEvent};
pub use types::{
    now_ms, parse_level, ConnectionStatus, DepthSnapshot, LatencyStats, Metrics, MetricsPatch,
    OrderbookSlice, PriceLevel, RawDelta, SyncMode,
};
