//! Producer host lifecycle.

pub mod host;

pub use host::{ProducerHandle, ProducerHost, PUBLISH_INTERVAL};
