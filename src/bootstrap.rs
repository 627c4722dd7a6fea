//! Pulls a bounded pack from a configured primary resolver at startup so a
//! replica has useful content before it ever sees a notifier gossip round.

use std::time::Duration;

use claimsrv_store::Store;
use tracing::{info, warn};

/// Runs the bootstrap fetch if `primary` is set and `max_replication_pack`
/// is non-zero. Any failure is logged and swallowed: the replica simply
/// continues with whatever it already has on disk.
pub async fn run(store: &Store, primary: Option<&str>, max_replication_pack: i64, timeout: Duration, client: &reqwest::Client) {
    let Some(primary) = primary else {
        return;
    };
    if max_replication_pack == 0 {
        return;
    }

    let url = format!("{primary}/jwt/v1/pack?max={max_replication_pack}");
    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(%err, "replica bootstrap request failed, continuing with local content");
            return;
        }
    };

    if !response.status().is_success() {
        warn!(status = %response.status(), "replica bootstrap returned non-200, continuing with local content");
        return;
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "failed to read replica bootstrap response body");
            return;
        }
    };
    if body.is_empty() {
        info!("replica bootstrap pack was empty");
        return;
    }

    match store.merge(&body) {
        Ok(()) => info!("replica bootstrap merge complete"),
        Err(err) => warn!(%err, "replica bootstrap merge failed"),
    }
}
