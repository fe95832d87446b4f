//! Shared setup for the skarv binaries.

pub mod common;
