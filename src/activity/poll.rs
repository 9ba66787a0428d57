// =============================================================================
// Activity Poller — pull-based fallback while the stream is down
// =============================================================================
//
// Two cadences share one task:
//   fast  — per-wallet recent-activity fetch (TRADE records), default 2 s
//   slow  — 30 s sweep for the SPLIT/MERGE/REDEEM activity the stream does
//           not carry
//
// The supervisor gates the fast loop through the `enabled` flag (on when the
// stream has been disconnected for 5 s, off on reconnect). The slow sweep
// always runs: non-trade activity has no streaming source. Every fetched
// record goes through the same ingress channel as the stream; the gate
// dedups overlapping catch-up windows.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::polymarket::{PolymarketClient, RawActivity};
use crate::runtime_config::PollingConfig;
use crate::state_store::StateStore;

/// Cadence of the non-trade (SPLIT/MERGE/REDEEM) sweep.
const NON_TRADE_SWEEP: Duration = Duration::from_secs(30);

/// Run the poller until shutdown.
pub async fn run_poller(
    client: Arc<PolymarketClient>,
    store: Arc<StateStore>,
    targets: Vec<String>,
    polling: PollingConfig,
    ingress_tx: mpsc::Sender<RawActivity>,
    enabled: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut fast = interval(Duration::from_millis(polling.interval_ms.max(250)));
    fast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut slow = interval(NON_TRADE_SWEEP);
    slow.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(
        interval_ms = polling.interval_ms,
        targets = targets.len(),
        "activity poller running"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }

            _ = fast.tick() => {
                if !*enabled.borrow() {
                    continue;
                }
                for wallet in &targets {
                    if let Err(e) =
                        poll_wallet(&client, &store, wallet, &polling, &ingress_tx, true).await
                    {
                        warn!(wallet = %wallet, error = %e, "activity poll failed");
                    }
                }
            }

            _ = slow.tick() => {
                for wallet in &targets {
                    if let Err(e) =
                        poll_wallet(&client, &store, wallet, &polling, &ingress_tx, false).await
                    {
                        warn!(wallet = %wallet, error = %e, "non-trade sweep failed");
                    }
                }
            }
        }
    }
}

/// Fetch recent activity for one wallet and forward the matching records.
/// `trades_only` selects the fast loop's TRADE filter; the slow sweep takes
/// the complement.
async fn poll_wallet(
    client: &PolymarketClient,
    store: &StateStore,
    wallet: &str,
    polling: &PollingConfig,
    ingress_tx: &mpsc::Sender<RawActivity>,
    trades_only: bool,
) -> Result<()> {
    let records = fetch_with_retry(client, wallet, polling).await?;

    let mut newest_ts = store.last_poll_ts(wallet).unwrap_or(0);
    for record in records {
        let is_trade = record.activity_type.eq_ignore_ascii_case("TRADE");
        if is_trade != trades_only {
            continue;
        }

        let ts = super::normalizer::canonical_ms(record.timestamp);
        if ts > newest_ts {
            newest_ts = ts;
        }

        if ingress_tx.send(record).await.is_err() {
            // Channel closed: supervisor stopping.
            return Ok(());
        }
    }
    store.set_last_poll_ts(wallet, newest_ts);

    Ok(())
}

/// HTTP fetch with jittered exponential backoff.
async fn fetch_with_retry(
    client: &PolymarketClient,
    wallet: &str,
    polling: &PollingConfig,
) -> Result<Vec<RawActivity>> {
    let mut attempt = 0;
    loop {
        match client.get_activity(wallet, polling.trade_limit).await {
            Ok(records) => return Ok(records),
            Err(e) if attempt < polling.max_retries => {
                attempt += 1;
                let delay = jittered(polling.base_backoff_ms * 2_u64.saturating_pow(attempt - 1));
                debug!(
                    wallet,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "activity fetch failed — backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply ±25 % jitter to a base delay.
fn jittered(base_ms: u64) -> Duration {
    let base = base_ms.max(1) as f64;
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base * factor) as u64)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_quarter_band() {
        for _ in 0..200 {
            let d = jittered(1_000);
            assert!(d >= Duration::from_millis(750), "{d:?} below band");
            assert!(d <= Duration::from_millis(1_250), "{d:?} above band");
        }
    }

    #[test]
    fn jitter_handles_zero_base() {
        // Degenerate config should not panic.
        let _ = jittered(0);
    }
}
