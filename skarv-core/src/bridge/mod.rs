//! Frame-synchronized consumer bridge and metrics.

pub mod frame;
pub mod latency;

pub use frame::{FrameBridge, FRAME_INTERVAL_MS, METRICS_INTERVAL_MS};
pub use latency::{LatencyWindow, LATENCY_WINDOW};
