//! Crate-level error types.
//!
//! [`SkarvError`] unifies the fallible boundaries of the core (configuration,
//! transport, snapshot fetch) behind a single enum so callers can match on
//! the variant they care about while still using the `?` operator.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SkarvError>;

/// Top-level error type returned by public APIs of the core.
#[derive(Debug, thiserror::Error)]
pub enum SkarvError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but carries an invalid value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The REST snapshot fetch failed (network, status, or shape).
    #[error("snapshot fetch error: {0}")]
    Snapshot(String),

    /// HTTP transport failure during the snapshot fetch.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The reconnect ladder was exhausted.
    #[error("transport gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },

    /// The leader-election cell could not be read or written.
    #[error("election cell error: {0}")]
    ElectionCell(String),
}
