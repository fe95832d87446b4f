//! Exchange-facing streaming transport.

pub mod ws;

pub use ws::{DepthStream, DepthStreamHandle, TransportEvent};
