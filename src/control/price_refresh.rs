// =============================================================================
// Price Refresh — paper-book mark-to-market and settlement
// =============================================================================
//
// Paper mode only. Every 30 s: refresh the mark price of each open paper
// position from the market catalog, and settle positions whose market has
// resolved (winning outcome at 1.0, losing at 0.0). Settlement idempotency
// lives in the book itself.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::events::{EngineEvent, EventBus};
use crate::paper::PaperBook;
use crate::runtime_config::AppConfig;
use crate::token_resolver::TokenResolver;

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Run the mark + settle loop until shutdown.
pub async fn run_price_refresh(
    paper: Arc<PaperBook>,
    resolver: Arc<TokenResolver>,
    config: Arc<RwLock<AppConfig>>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(interval_s = REFRESH_INTERVAL.as_secs(), "paper price refresh started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if !config.read().paper_trading.enabled {
                    continue;
                }
                refresh(&paper, &resolver, &events).await;
            }
        }
    }
}

async fn refresh(paper: &PaperBook, resolver: &TokenResolver, events: &EventBus) {
    for position in paper.positions() {
        if position.settled {
            continue;
        }

        let market = if let Some(condition_id) = position.condition_id.as_deref() {
            match resolver.market_for_condition(condition_id).await {
                Ok(Some(m)) => Some(m),
                _ => None,
            }
        } else {
            resolver.market_for_token(&position.token_id)
        };

        let Some(market) = market else {
            debug!(token_id = %position.token_id, "no catalog entry for paper position");
            continue;
        };

        if let Some(price) = market.price_for_token(&position.token_id) {
            paper.mark_price(&position.token_id, price);
        }

        if market.is_closed() {
            paper.mark_resolved(&position.token_id);
            let won = market
                .price_for_token(&position.token_id)
                .map(|p| p >= 0.5)
                .unwrap_or(false);

            if let Some(pnl) = paper.settle(&position.token_id, won) {
                let name = position
                    .market_title
                    .clone()
                    .or(position.market_slug.clone())
                    .unwrap_or_else(|| position.token_id.clone());
                info!(market = %name, won, pnl, "paper position settled");
                events.publish(EngineEvent::Log {
                    level: "info".to_string(),
                    message: format!(
                        "Settled {name}: {} (P&L {pnl:+.2})",
                        if won { "won" } else { "lost" }
                    ),
                });
            }
        }
    }
}
