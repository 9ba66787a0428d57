// =============================================================================
// Stop-Loss Sweep — periodic forced exit of deep-loss positions
// =============================================================================
//
// Live mode only (off in dry-run and paper). Every sweep walks the held
// positions; any unsettled position whose mark-to-market loss has reached
// the configured threshold is sold through the executor queue with a wider
// slippage cushion (5 %) so the exit actually crosses.
//
// A per-token triggered set stops the sweep from flapping while an exit is
// in flight; entries are cleared only when the SELL fails, so the next sweep
// retries. The set is in-memory and resets on restart.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::executor::ExecutorHandle;
use crate::runtime_config::AppConfig;
use crate::sizing::{quantize, slip_price};
use crate::state_store::StateStore;
use crate::token_resolver::TokenResolver;
use crate::types::{OrderRequest, Position, Side};

/// Exits use a wider cushion than copied trades.
const STOP_LOSS_SLIPPAGE: f64 = 0.05;

/// Loss check against cost basis. `threshold_pct` of 80 means "sell once the
/// position has lost 80 % of its cost".
pub fn should_trigger(cost_basis: f64, current_value: f64, threshold_pct: f64) -> bool {
    if cost_basis <= 0.0 {
        return false;
    }
    let loss_ratio = (current_value - cost_basis) / cost_basis;
    loss_ratio <= -(threshold_pct / 100.0)
}

/// Run the stop-loss sweep until shutdown.
pub async fn run_stop_loss(
    store: Arc<StateStore>,
    resolver: Arc<TokenResolver>,
    executor: ExecutorHandle,
    config: Arc<RwLock<AppConfig>>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval_ms = config.read().stop_loss.check_interval_ms.max(1_000);
    let mut ticker = interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut triggered: HashSet<String> = HashSet::new();

    info!(interval_ms, "stop-loss sweep started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let (enabled, live, threshold_pct) = {
                    let cfg = config.read();
                    (cfg.stop_loss.enabled, cfg.is_live(), cfg.stop_loss.percent)
                };
                if !enabled || !live {
                    continue;
                }
                sweep(&store, &resolver, &executor, &events, threshold_pct, &mut triggered).await;
            }
        }
    }
}

async fn sweep(
    store: &StateStore,
    resolver: &TokenResolver,
    executor: &ExecutorHandle,
    events: &EventBus,
    threshold_pct: f64,
    triggered: &mut HashSet<String>,
) {
    for position in store.snapshot_positions() {
        if position.settled || position.shares <= 0.0 || position.cost_basis() <= 0.0 {
            continue;
        }
        if triggered.contains(&position.token_id) {
            continue;
        }

        let Some(current_price) = lookup_price(resolver, &position).await else {
            debug!(token_id = %position.token_id, "no price for stop-loss check");
            continue;
        };

        let current_value = position.shares * current_price;
        if !should_trigger(position.cost_basis(), current_value, threshold_pct) {
            continue;
        }

        let loss_pct =
            (position.cost_basis() - current_value) / position.cost_basis() * 100.0;
        let market = position
            .market_title
            .clone()
            .or(position.market_slug.clone())
            .unwrap_or_else(|| position.token_id.clone());
        warn!(
            market = %market,
            loss_pct = format!("{loss_pct:.1}"),
            shares = position.shares,
            "stop-loss triggered — selling position"
        );
        events.publish(EngineEvent::Log {
            level: "warn".to_string(),
            message: format!("Stop-loss: selling {market} at {loss_pct:.1}% loss"),
        });

        triggered.insert(position.token_id.clone());

        let price = slip_price(current_price, Side::Sell, STOP_LOSS_SLIPPAGE);
        let request = OrderRequest {
            token_id: position.token_id.clone(),
            side: Side::Sell,
            price,
            size_shares: position.shares,
            usd: quantize(price * position.shares),
            time_in_force: "GTC".to_string(),
        };

        match executor.submit_and_wait(request, None, None).await {
            Ok(result) if result.success => {
                info!(token_id = %position.token_id, "stop-loss exit filled");
            }
            Ok(result) => {
                // Clear so the next sweep retries.
                triggered.remove(&position.token_id);
                warn!(
                    token_id = %position.token_id,
                    error = ?result.error,
                    reason = ?result.skip_reason,
                    "stop-loss exit failed — will retry"
                );
            }
            Err(e) => {
                triggered.remove(&position.token_id);
                warn!(token_id = %position.token_id, error = %e, "stop-loss submit failed");
            }
        }
    }
}

/// Current market price for a held position, via the resolver cache and
/// catalog.
async fn lookup_price(resolver: &TokenResolver, position: &Position) -> Option<f64> {
    if let Some(condition_id) = position.condition_id.as_deref() {
        if let Ok(Some(market)) = resolver.market_for_condition(condition_id).await {
            if let Some(price) = market.price_for_token(&position.token_id) {
                return Some(price);
            }
        }
    }
    resolver
        .market_for_token(&position.token_id)
        .and_then(|m| m.price_for_token(&position.token_id))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_past_threshold() {
        // 100 shares at avg 0.40 (cost 40.00), marked 0.07 → value 7.00,
        // an 82.5 % loss against an 80 % threshold.
        assert!(should_trigger(40.0, 7.0, 80.0));
    }

    #[test]
    fn holds_inside_threshold() {
        // 50 % down, threshold 80 %: no trigger.
        assert!(!should_trigger(40.0, 20.0, 80.0));
        // Exactly at the threshold triggers.
        assert!(should_trigger(40.0, 8.0, 80.0));
        // Profitable positions never trigger.
        assert!(!should_trigger(40.0, 60.0, 80.0));
    }

    #[test]
    fn zero_cost_basis_never_triggers() {
        assert!(!should_trigger(0.0, 0.0, 80.0));
        assert!(!should_trigger(-1.0, 5.0, 80.0));
    }
}
