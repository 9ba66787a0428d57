// =============================================================================
// Auto-Redeem Sweep — convert winning tokens of resolved markets
// =============================================================================
//
// Live mode only. Each sweep refreshes the resolution status of held
// positions from the market catalog, then issues a redemption request for
// every redeemable winner. An attempted set keeps one redemption request per
// token id for the lifetime of the run.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::polymarket::PolymarketClient;
use crate::runtime_config::AppConfig;
use crate::state_store::StateStore;
use crate::token_resolver::TokenResolver;

/// Run the auto-redeem sweep until shutdown.
pub async fn run_auto_redeem(
    store: Arc<StateStore>,
    resolver: Arc<TokenResolver>,
    client: Arc<PolymarketClient>,
    config: Arc<RwLock<AppConfig>>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval_ms = config.read().auto_redeem.interval_ms.max(10_000);
    let mut ticker = interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut attempted: HashSet<String> = HashSet::new();

    info!(interval_ms, "auto-redeem sweep started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let (enabled, live) = {
                    let cfg = config.read();
                    (cfg.auto_redeem.enabled, cfg.is_live())
                };
                if !enabled || !live {
                    continue;
                }
                sweep(&store, &resolver, &client, &events, &mut attempted).await;
            }
        }
    }
}

async fn sweep(
    store: &StateStore,
    resolver: &TokenResolver,
    client: &PolymarketClient,
    events: &EventBus,
    attempted: &mut HashSet<String>,
) {
    for mut position in store.snapshot_positions() {
        if position.settled || position.shares <= 0.0 {
            continue;
        }
        if attempted.contains(&position.token_id) {
            continue;
        }

        let Some(condition_id) = position.condition_id.clone() else {
            continue;
        };

        // Refresh resolution status from the catalog.
        if !position.redeemable {
            let market = match resolver.market_for_condition(&condition_id).await {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(e) => {
                    debug!(condition_id = %condition_id, error = %e, "catalog check failed");
                    continue;
                }
            };
            if !market.is_closed() {
                continue;
            }

            let won = market
                .price_for_token(&position.token_id)
                .map(|p| p >= 0.5)
                .unwrap_or(false);

            position.resolved = true;
            position.redeemable = won;
            if let Err(e) = store.upsert_position(position.clone()) {
                warn!(error = %e, "failed to persist resolution status");
            }
            if !won {
                // Losing side has nothing to redeem; marking attempted stops
                // rechecking every sweep.
                attempted.insert(position.token_id.clone());
                continue;
            }
        }

        attempted.insert(position.token_id.clone());

        match client.redeem(&condition_id).await {
            Ok(()) => {
                let market = position
                    .market_title
                    .clone()
                    .or(position.market_slug.clone())
                    .unwrap_or(condition_id.clone());
                info!(
                    token_id = %position.token_id,
                    market = %market,
                    shares = position.shares,
                    "redemption requested"
                );
                events.publish(EngineEvent::Log {
                    level: "info".to_string(),
                    message: format!("Auto-redeem: requested redemption for {market}"),
                });
            }
            Err(e) => {
                warn!(
                    token_id = %position.token_id,
                    error = %e,
                    "redemption request failed"
                );
                events.publish(EngineEvent::Error {
                    message: format!("Redemption failed for {}: {e}", position.token_id),
                });
            }
        }
    }
}
