// =============================================================================
// Activity Stream — push-based feed of target-wallet fills
// =============================================================================
//
// One long-lived WebSocket to the live-activity service, subscribed to the
// `activity:trades` and `activity:orders_matched` channels. Messages are
// filtered in-process by wallet; survivors go to the ingress channel raw
// (deduplication is the ingress gate's job, not ours).
//
// Liveness is application-level: a text ping every 15 s, and any 30 s without
// inbound traffic counts as a disconnect. Reconnects back off exponentially
// from 5 s; after 10 straight failures the stream escalates to Degraded and
// leaves the poller in charge until a manual restart.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::polymarket::RawActivity;

const LIVE_ACTIVITY_WSS_URL: &str = "wss://ws-live-data.polymarket.com";

/// Application-level heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// No inbound traffic for this long counts as a dead connection.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect backoff base and per-connection attempt cap.
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Connect deadline; the reconnect loop treats a slow handshake as a failure.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Lock-free counters for the status API.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub messages_total: AtomicU64,
    pub target_matches_total: AtomicU64,
    /// Records dropped because the ingress channel was full.
    pub dropped_total: AtomicU64,
}

/// Connection state published to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect attempts exhausted; no further attempts until restart.
    Degraded,
}

/// Run the activity stream until shutdown or degradation.
///
/// `targets` is fixed for the lifetime of this task; target changes take
/// effect on supervisor restart.
pub async fn run_activity_stream(
    targets: HashSet<String>,
    ingress_tx: mpsc::Sender<RawActivity>,
    status_tx: watch::Sender<StreamStatus>,
    metrics: Arc<StreamMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let _ = status_tx.send(StreamStatus::Connecting);

        match connect_and_read(&targets, &ingress_tx, &status_tx, &metrics, &mut shutdown).await {
            Ok(()) => {
                // Clean exit: shutdown was requested.
                return;
            }
            Err(e) => {
                // A round that reached Connected resets the attempt budget;
                // the cap only counts consecutive failed connects.
                if *status_tx.borrow() == StreamStatus::Connected {
                    attempts = 1;
                } else {
                    attempts += 1;
                }
                let _ = status_tx.send(StreamStatus::Disconnected);

                if attempts >= RECONNECT_MAX_ATTEMPTS {
                    error!(
                        attempts,
                        error = %e,
                        "activity stream reconnect attempts exhausted — degrading to poll-only"
                    );
                    let _ = status_tx.send(StreamStatus::Degraded);
                    return;
                }

                let delay = (RECONNECT_BASE * 2_u32.saturating_pow(attempts - 1))
                    .min(RECONNECT_MAX_DELAY);
                warn!(
                    attempts,
                    delay_s = delay.as_secs(),
                    error = %e,
                    "activity stream disconnected — reconnecting"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

/// One connection lifetime. `Ok(())` means shutdown; `Err` means the
/// connection dropped and the caller should back off and retry.
async fn connect_and_read(
    targets: &HashSet<String>,
    ingress_tx: &mpsc::Sender<RawActivity>,
    status_tx: &watch::Sender<StreamStatus>,
    metrics: &StreamMetrics,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!(url = LIVE_ACTIVITY_WSS_URL, "connecting to activity stream");

    let (ws_stream, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, connect_async(LIVE_ACTIVITY_WSS_URL))
            .await
            .context("activity stream connect timed out")?
            .context("failed to connect to activity stream")?;

    let (mut write, mut read) = ws_stream.split();

    // Both activity channels ride one subscription frame.
    let sub_msg = serde_json::json!({
        "action": "subscribe",
        "subscriptions": [
            { "topic": "activity", "type": "trades" },
            { "topic": "activity", "type": "orders_matched" },
        ],
    });
    write
        .send(Message::Text(sub_msg.to_string()))
        .await
        .context("failed to send activity subscriptions")?;

    info!(targets = targets.len(), "activity stream connected and subscribed");
    let _ = status_tx.send(StreamStatus::Connected);

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }

            _ = heartbeat.tick() => {
                if last_inbound.elapsed() >= LIVENESS_TIMEOUT {
                    anyhow::bail!("heartbeat missed — no traffic for {:?}", last_inbound.elapsed());
                }
                write
                    .send(Message::Text("ping".to_string()))
                    .await
                    .context("heartbeat send failed")?;
            }

            msg = read.next() => {
                let Some(msg) = msg else {
                    anyhow::bail!("activity stream ended");
                };

                match msg {
                    Ok(Message::Text(text)) => {
                        last_inbound = Instant::now();
                        handle_text(&text, targets, ingress_tx, metrics);
                    }
                    Ok(Message::Ping(payload)) => {
                        last_inbound = Instant::now();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_inbound = Instant::now();
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "activity stream close frame");
                        anyhow::bail!("server closed the activity stream");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(e).context("activity stream read error");
                    }
                }
            }
        }
    }
}

/// Parse a stream frame and forward matching records to the ingress channel.
/// A full channel drops the newest record and counts it; the pipeline is the
/// bottleneck in that case and stale activity is worth less than fresh.
fn handle_text(
    text: &str,
    targets: &HashSet<String>,
    ingress_tx: &mpsc::Sender<RawActivity>,
    metrics: &StreamMetrics,
) {
    if text.eq_ignore_ascii_case("pong") {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return,
    };

    // Frames arrive as a single record, an array of records, or an envelope
    // with the record under `payload`.
    let payloads: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(arr) => arr,
        serde_json::Value::Object(mut obj) => match obj.remove("payload") {
            Some(serde_json::Value::Array(arr)) => arr,
            Some(inner @ serde_json::Value::Object(_)) => vec![inner],
            _ => vec![serde_json::Value::Object(obj)],
        },
        _ => return,
    };

    for payload in payloads {
        metrics.messages_total.fetch_add(1, Ordering::Relaxed);

        let record: RawActivity = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "unparseable activity frame");
                continue;
            }
        };

        if !targets.contains(&record.proxy_wallet.to_lowercase()) {
            continue;
        }
        metrics.target_matches_total.fetch_add(1, Ordering::Relaxed);

        match ingress_tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Supervisor is stopping.
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> HashSet<String> {
        let mut t = HashSet::new();
        t.insert("0xabc".to_string());
        t
    }

    #[tokio::test]
    async fn envelope_payload_is_unwrapped_and_filtered() {
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = StreamMetrics::default();

        let frame = serde_json::json!({
            "topic": "activity",
            "type": "trades",
            "payload": {
                "proxyWallet": "0xABC",
                "timestamp": 1_700_000_000,
                "asset": "tok",
                "side": "BUY",
                "price": "0.42",
                "size": "10",
                "type": "TRADE"
            }
        })
        .to_string();

        handle_text(&frame, &targets(), &tx, &metrics);

        let record = rx.try_recv().unwrap();
        assert_eq!(record.proxy_wallet, "0xABC");
        assert_eq!(metrics.messages_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.target_matches_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn non_target_wallets_are_filtered_out() {
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = StreamMetrics::default();

        let frame = serde_json::json!({
            "payload": {
                "proxyWallet": "0xother",
                "timestamp": 1_700_000_000,
                "asset": "tok",
                "side": "SELL",
                "price": 0.5,
                "size": 1,
                "type": "TRADE"
            }
        })
        .to_string();

        handle_text(&frame, &targets(), &tx, &metrics);

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.messages_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.target_matches_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn array_frames_fan_out() {
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = StreamMetrics::default();

        let frame = serde_json::json!([
            { "proxyWallet": "0xabc", "timestamp": 1, "asset": "a", "side": "BUY",
              "price": 0.1, "size": 1, "type": "TRADE" },
            { "proxyWallet": "0xabc", "timestamp": 2, "asset": "b", "side": "SELL",
              "price": 0.2, "size": 2, "type": "TRADE" }
        ])
        .to_string();

        handle_text(&frame, &targets(), &tx, &metrics);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(metrics.messages_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn pong_and_garbage_are_ignored() {
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = StreamMetrics::default();

        handle_text("pong", &targets(), &tx, &metrics);
        handle_text("not json at all", &targets(), &tx, &metrics);

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.messages_total.load(Ordering::Relaxed), 0);
    }
}
