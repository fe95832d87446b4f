//! Feed configuration and exchange endpoint mapping.
//!
//! Configuration is a small value object: distribution mode, exchange
//! selection, and slice depth. It loads from defaults, an optional TOML
//! file, and `SKARV_`-prefixed environment variables, in that order.

use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::SyncMode;
use crate::error::{Result, SkarvError};

/// Default number of levels per side emitted in slices.
pub const DEFAULT_DEPTH: u32 = 15;

/// Exchange selection; picks an endpoint triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Spot,
    Futures,
}

impl Default for Exchange {
    fn default() -> Self {
        Exchange::Spot
    }
}

/// Endpoint triple for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ws_url: &'static str,
    pub rest_url: &'static str,
    pub stream_suffix: &'static str,
    pub symbol: &'static str,
}

impl Endpoints {
    /// Full streaming URL: `{ws_url}/{lowercased symbol}{suffix}`.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}{}",
            self.ws_url,
            self.symbol.to_lowercase(),
            self.stream_suffix
        )
    }
}

impl Exchange {
    /// The endpoint triple for this exchange.
    pub fn endpoints(&self) -> Endpoints {
        match self {
            Exchange::Spot => Endpoints {
                ws_url: "wss://stream.binance.us:9443/ws",
                rest_url: "https://api.binance.us/api/v3/depth",
                stream_suffix: "@depth@100ms",
                symbol: "BTCUSD",
            },
            Exchange::Futures => Endpoints {
                ws_url: "wss://fstream.binance.com/ws",
                rest_url: "https://fapi.binance.com/fapi/v1/depth",
                stream_suffix: "@depth",
                symbol: "BTCUSDT",
            },
        }
    }
}

/// Single-process feed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Distribution fabric variant.
    #[serde(default)]
    pub mode: SyncMode,

    /// Exchange endpoint selection.
    #[serde(default)]
    pub exchange: Exchange,

    /// Max levels per side emitted in slices.
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    DEFAULT_DEPTH
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            exchange: Exchange::default(),
            depth: DEFAULT_DEPTH,
        }
    }
}

impl FeedConfig {
    /// Load configuration from an optional TOML file with environment
    /// variable overrides (`SKARV_MODE=broadcast`, `SKARV_DEPTH=20`, ...).
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ConfigLoader::builder()
            .set_default("mode", "shared")?
            .set_default("exchange", "spot")?
            .set_default("depth", DEFAULT_DEPTH as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        let loaded = builder
            .add_source(Environment::with_prefix("SKARV").separator("__"))
            .build()?;

        let cfg: FeedConfig = loaded.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(SkarvError::InvalidConfig(
                "depth must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    /// Endpoints implied by the configured exchange.
    pub fn endpoints(&self) -> Endpoints {
        self.exchange.endpoints()
    }
}
