//! Skarv Core - Market-Depth Feed Distribution
//!
//! Ingests a high-frequency diff-depth feed for a single instrument,
//! maintains a locally consistent order book, and distributes compact
//! top-of-book slices to concurrently running consumer contexts at a
//! bounded, display-synchronized rate.
//!
//! ## System Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PRODUCER SIDE                         │
//! │                                                              │
//! │  ┌────────────┐   ┌──────────────────┐   ┌───────────────┐  │
//! │  │ DepthStream│──▶│ SequenceManager  │──▶│  BookEngine   │  │
//! │  │ (websocket)│   │ buffer/snapshot/ │   │  price→size   │  │
//! │  └────────────┘   │ gap validation   │   │  top-N slices │  │
//! │        │          └──────────────────┘   └───────┬───────┘  │
//! │        │ RawDelta          ▲ REST snapshot       │ slice    │
//! │        ▼                   │ (reqwest)           ▼          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │            ProducerHost (single task, 100 ms tick)   │   │
//! │  └──────────────────────────┬───────────────────────────┘   │
//! └─────────────────────────────┼────────────────────────────────┘
//!                               │ SlicePublisher seam
//!           ┌───────────────────┼───────────────────┐
//!           ▼                   ▼                   ▼
//!    ┌────────────┐     ┌──────────────┐    ┌──────────────┐
//!    │ SharedHost │     │ LeaderFabric │    │ SliceRegion  │
//!    │ port fanout│     │ bus + lease  │    │ atomic shm   │
//!    └─────┬──────┘     └──────┬───────┘    └──────┬───────┘
//!          ▼                   ▼                   ▼
//!    ┌──────────────────────────────────────────────────┐
//!    │   FrameBridge (≤ 1 store update per frame)       │
//!    │   ReactiveStore (per-field change notifications) │
//!    └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Modules
//!
//! - [`transport`] - WebSocket depth stream with capped backoff reconnect
//! - [`sync`] - snapshot/delta reconciliation and gap policy
//! - [`book`] - order-book state and slice extraction
//! - [`producer`] - the host task composing the three above
//! - [`fabric`] - shared-host, leader-replicated, and shared-memory
//!   distribution variants
//! - [`bridge`] - frame-synchronized consumer bridge and metrics
//! - [`store`] - reactive per-field state container
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use skarv_core::config::FeedConfig;
//! use skarv_core::data::ProducerEvent;
//! use skarv_core::fabric::EventPublisher;
//! use skarv_core::producer::ProducerHost;
//! use tokio::sync::mpsc;
//!
//! # async fn run() {
//! let config = FeedConfig::default();
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let producer = ProducerHost::spawn(config.depth, Box::new(EventPublisher::new(tx)));
//! producer.connect(&config.endpoints());
//!
//! while let Some(event) = rx.recv().await {
//!     if let ProducerEvent::OrderbookUpdate { data, .. } = event {
//!         println!("best bid: {:?}", data.best_bid());
//!     }
//! }
//! # }
//! ```

pub mod book;
pub mod bridge;
pub mod config;
pub mod data;
pub mod error;
pub mod fabric;
pub mod producer;
pub mod resilience;
pub mod store;
pub mod sync;
pub mod transport;
pub mod utils;

pub use book::BookEngine;
pub use bridge::FrameBridge;
pub use config::{Endpoints, Exchange, FeedConfig};
pub use data::{ConnectionStatus, Metrics, OrderbookSlice, PriceLevel, SyncMode};
pub use error::{Result, SkarvError};
pub use producer::{ProducerHandle, ProducerHost};
pub use store::ReactiveStore;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::book::BookEngine;
    pub use crate::bridge::FrameBridge;
    pub use crate::config::{Endpoints, Exchange, FeedConfig};
    pub use crate::data::{
        ConnectionStatus, ConsumerControl, Metrics, OrderbookSlice, PriceLevel, ProducerEvent,
        SyncMode,
    };
    pub use crate::fabric::{
        ElectionCell, EventPublisher, LeaderFabric, LeaderFabricConfig, MemoryCell, SharedHost,
        SharedHostConfig, ShmPublisher, SlicePublisher, SliceReader, SliceRegion, SliceWriter,
    };
    pub use crate::producer::{ProducerHandle, ProducerHost};
    pub use crate::store::ReactiveStore;
    pub use crate::{Result, SkarvError};
}
