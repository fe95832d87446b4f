//! One-shot REST depth snapshot fetch.

use std::time::Duration;

use tracing::{debug, warn};

use crate::data::DepthSnapshot;
use crate::error::{Result, SkarvError};

/// Hard cap on a single snapshot request.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Linear delay between snapshot attempts.
pub const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Depth limit requested from the REST endpoint.
pub const SNAPSHOT_LIMIT: u32 = 1000;

/// Fetches depth snapshots from the exchange REST endpoint.
///
/// Each call is a single attempt; the caller owns the retry ladder (and
/// its attempt budget) so that HTTP failures and too-old snapshots draw
/// from the same cap. Dropping the future (e.g. when the host selects an
/// abort signal) cancels the request; an aborted attempt is not retried.
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    client: reqwest::Client,
    rest_url: String,
    symbol: String,
}

impl SnapshotFetcher {
    pub fn new(rest_url: impl Into<String>, symbol: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            rest_url: rest_url.into(),
            symbol: symbol.into(),
        }
    }

    /// The request URL: `{rest_url}?symbol={SYMBOL}&limit=1000`.
    pub fn url(&self) -> String {
        format!(
            "{}?symbol={}&limit={}",
            self.rest_url,
            self.symbol.to_uppercase(),
            SNAPSHOT_LIMIT
        )
    }

    /// Perform one snapshot attempt.
    pub async fn fetch(&self) -> Result<DepthSnapshot> {
        let url = self.url();
        debug!(%url, "fetching depth snapshot");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "snapshot request rejected");
            return Err(SkarvError::Snapshot(format!(
                "snapshot request failed with status {status}"
            )));
        }

        // Shape validation happens in deserialization: a response missing
        // lastUpdateId or the level arrays is rejected here.
        let snapshot: DepthSnapshot = response
            .json()
            .await
            .map_err(|e| SkarvError::Snapshot(format!("snapshot shape invalid: {e}")))?;

        debug!(
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "snapshot received"
        );
        Ok(snapshot)
    }
}
