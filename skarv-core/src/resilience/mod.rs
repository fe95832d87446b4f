//! Retry and reconnection primitives.

pub mod backoff;

pub use backoff::{BackoffConfig, ExponentialBackoff};
