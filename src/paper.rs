// =============================================================================
// Paper Book — self-contained simulated exchange
// =============================================================================
//
// Executes orders against an in-process book with durable state
// (`paper-state.json`): cash balance, averaged positions, a full trade log,
// and derived statistics. Fees apply to notional on both sides.
//
// SELLs with no holdings open a short (negative shares). Settlement applies
// a resolved market at 1.0 / 0.0 and is idempotent: a settled position is
// never re-settled.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state_store::{read_json_or_default, write_json_atomic};
use crate::types::{OrderRequest, OrderResult, Position, Side, Signal, SkipReason};

const PAPER_STATE_FILE: &str = "paper-state.json";

/// Shares below this are treated as a flat position.
const SHARES_EPSILON: f64 = 1e-9;

// =============================================================================
// Wire shapes
// =============================================================================

/// One executed (or settled) paper fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperTrade {
    pub id: String,
    pub token_id: String,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub market_title: Option<String>,
    pub side: Side,
    pub price: f64,
    pub shares: f64,
    pub usd: f64,
    pub fee: f64,
    /// Present on closes and settlements.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaperStateFile {
    starting_balance: f64,
    current_balance: f64,
    #[serde(default)]
    positions: HashMap<String, Position>,
    #[serde(default)]
    trades: Vec<PaperTrade>,
    created_at: String,
    updated_at: String,
}

impl Default for PaperStateFile {
    fn default() -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            starting_balance: 0.0,
            current_balance: 0.0,
            positions: HashMap::new(),
            trades: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Statistics derived from the trade log on read.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    /// Σ wins / |Σ losses|; +∞ (serialized as null) when there are no losses.
    pub profit_factor: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_trade_size: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Full book snapshot for the portfolio API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperSnapshot {
    pub starting_balance: f64,
    pub current_balance: f64,
    pub positions: Vec<Position>,
    pub trades: Vec<PaperTrade>,
    pub stats: PaperStats,
}

/// Result of a manual position close.
#[derive(Debug, Clone, Serialize)]
pub struct ManualSellResult {
    pub success: bool,
    pub pnl: f64,
    pub proceeds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Book
// =============================================================================

/// Simulated exchange. One lock guards all mutation; reads take value
/// snapshots.
pub struct PaperBook {
    path: PathBuf,
    fee_rate: f64,
    inner: Mutex<PaperStateFile>,
}

impl PaperBook {
    /// Open (or initialize) the book under the data directory.
    pub fn open(data_dir: impl Into<PathBuf>, starting_balance: f64, fee_rate: f64) -> Result<Self> {
        let path = data_dir.into().join(PAPER_STATE_FILE);
        let mut state: PaperStateFile = read_json_or_default(&path)?;

        if state.starting_balance == 0.0 && state.trades.is_empty() {
            state.starting_balance = starting_balance;
            state.current_balance = starting_balance;
        }

        info!(
            balance = state.current_balance,
            positions = state.positions.len(),
            trades = state.trades.len(),
            "paper book opened"
        );

        Ok(Self {
            path,
            fee_rate,
            inner: Mutex::new(state),
        })
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute an order against the book. `signal` carries market metadata
    /// onto newly opened positions.
    pub fn execute(&self, request: &OrderRequest, signal: Option<&Signal>) -> OrderResult {
        match request.side {
            Side::Buy => self.buy(request, signal),
            Side::Sell => self.sell(request, signal),
        }
    }

    fn buy(&self, request: &OrderRequest, signal: Option<&Signal>) -> OrderResult {
        let mut state = self.inner.lock();
        let notional = request.price * request.size_shares;
        let fee = notional * self.fee_rate;

        if state.current_balance < notional + fee {
            debug!(
                balance = state.current_balance,
                needed = notional + fee,
                "paper BUY rejected — insufficient cash"
            );
            return OrderResult::skipped(SkipReason::InsufficientBalance);
        }

        state.current_balance -= notional + fee;

        let position = state
            .positions
            .entry(request.token_id.clone())
            .or_insert_with(|| {
                let mut p = Position::open(&request.token_id, 0.0, request.price);
                if let Some(sig) = signal {
                    p.condition_id = sig.condition_id.clone();
                    p.market_slug = sig.market_slug.clone();
                    p.market_title = sig.market_title.clone();
                    p.outcome = sig.outcome;
                }
                p
            });
        position.apply_buy(request.size_shares, request.price);
        position.mark(request.price);

        let trade = Self::record_trade(&mut state, request, signal, fee, None);
        self.persist(&mut state);

        OrderResult {
            success: true,
            order_id: Some(trade),
            executed_price: Some(request.price),
            executed_size: Some(request.size_shares),
            error: None,
            skip_reason: None,
        }
    }

    fn sell(&self, request: &OrderRequest, signal: Option<&Signal>) -> OrderResult {
        let mut state = self.inner.lock();
        let notional = request.price * request.size_shares;
        let fee = notional * self.fee_rate;

        let held = state
            .positions
            .get(&request.token_id)
            .map(|p| p.shares)
            .unwrap_or(0.0);

        let realized = if let Some(position) = state
            .positions
            .get_mut(&request.token_id)
            .filter(|p| p.shares >= request.size_shares - SHARES_EPSILON)
        {
            // Normal close or reduction.
            let gross = position.apply_sell(request.size_shares, request.price);
            position.mark(request.price);
            if !position.is_open() {
                state.positions.remove(&request.token_id);
            }
            gross - fee
        } else if held.abs() <= SHARES_EPSILON {
            // No holdings: open a short.
            let position = state
                .positions
                .entry(request.token_id.clone())
                .or_insert_with(|| {
                    let mut p = Position::open(&request.token_id, 0.0, request.price);
                    if let Some(sig) = signal {
                        p.condition_id = sig.condition_id.clone();
                        p.market_slug = sig.market_slug.clone();
                        p.market_title = sig.market_title.clone();
                        p.outcome = sig.outcome;
                    }
                    p
                });
            position.shares -= request.size_shares;
            position.avg_entry_price = request.price;
            position.total_cost = position.shares * request.price;
            position.mark(request.price);
            -fee
        } else {
            debug!(
                held,
                requested = request.size_shares,
                "paper SELL rejected — insufficient holdings"
            );
            return OrderResult::skipped(SkipReason::InsufficientHoldings);
        };

        state.current_balance += notional - fee;

        let trade = Self::record_trade(&mut state, request, signal, fee, Some(realized));
        self.persist(&mut state);

        OrderResult {
            success: true,
            order_id: Some(trade),
            executed_price: Some(request.price),
            executed_size: Some(request.size_shares),
            error: None,
            skip_reason: None,
        }
    }

    fn record_trade(
        state: &mut PaperStateFile,
        request: &OrderRequest,
        signal: Option<&Signal>,
        fee: f64,
        realized_pnl: Option<f64>,
    ) -> String {
        let id = format!("PAPER_{}", Uuid::new_v4());
        state.trades.push(PaperTrade {
            id: id.clone(),
            token_id: request.token_id.clone(),
            market_slug: signal.and_then(|s| s.market_slug.clone()),
            market_title: signal.and_then(|s| s.market_title.clone()),
            side: request.side,
            price: request.price,
            shares: request.size_shares,
            usd: request.price * request.size_shares,
            fee,
            realized_pnl,
            timestamp: Utc::now().to_rfc3339(),
        });
        id
    }

    // -------------------------------------------------------------------------
    // Mark-to-market and settlement
    // -------------------------------------------------------------------------

    /// Refresh the mark price of one position.
    pub fn mark_price(&self, token_id: &str, price: f64) {
        let mut state = self.inner.lock();
        if let Some(position) = state.positions.get_mut(token_id) {
            position.mark(price);
        }
        self.persist(&mut state);
    }

    /// Flag a position's market as resolved (pending settlement).
    pub fn mark_resolved(&self, token_id: &str) {
        let mut state = self.inner.lock();
        if let Some(position) = state.positions.get_mut(token_id) {
            position.resolved = true;
        }
    }

    /// Apply a resolution to a held position. `won` selects a settlement
    /// price of 1.0 or 0.0. Returns the settlement PnL, or `None` when the
    /// position is unknown or already settled.
    pub fn settle(&self, token_id: &str, won: bool) -> Option<f64> {
        let mut state = self.inner.lock();
        let settlement_price = if won { 1.0 } else { 0.0 };

        let (settlement_value, pnl, slug, title) = {
            let position = state.positions.get_mut(token_id)?;
            if position.settled {
                return None;
            }

            let settlement_value = position.shares * settlement_price;
            let pnl = settlement_value - position.total_cost;

            position.resolved = true;
            position.settled = true;
            position.settlement_price = Some(settlement_price);
            position.settlement_pnl = Some(pnl);
            position.shares = 0.0;
            position.unrealized_pnl = 0.0;

            (
                settlement_value,
                pnl,
                position.market_slug.clone(),
                position.market_title.clone(),
            )
        };

        state.current_balance += settlement_value;

        state.trades.push(PaperTrade {
            id: format!("SETTLE_{}", Uuid::new_v4()),
            token_id: token_id.to_string(),
            market_slug: slug,
            market_title: title,
            side: Side::Sell,
            price: settlement_price,
            shares: 0.0,
            usd: settlement_value,
            fee: 0.0,
            realized_pnl: Some(pnl),
            timestamp: Utc::now().to_rfc3339(),
        });

        info!(
            token_id,
            won,
            settlement_value,
            pnl,
            "paper position settled"
        );

        self.persist(&mut state);
        Some(pnl)
    }

    /// Close an open position at its current mark (UI "sell now" button).
    pub fn sell_position(&self, token_id: &str) -> ManualSellResult {
        let (price, shares) = {
            let state = self.inner.lock();
            match state.positions.get(token_id) {
                Some(p) if p.is_open() && p.shares > 0.0 => (p.current_price, p.shares),
                Some(_) => {
                    return ManualSellResult {
                        success: false,
                        pnl: 0.0,
                        proceeds: 0.0,
                        error: Some("position is not open".to_string()),
                    }
                }
                None => {
                    return ManualSellResult {
                        success: false,
                        pnl: 0.0,
                        proceeds: 0.0,
                        error: Some("no such position".to_string()),
                    }
                }
            }
        };

        if price <= 0.0 {
            return ManualSellResult {
                success: false,
                pnl: 0.0,
                proceeds: 0.0,
                error: Some("no mark price yet".to_string()),
            };
        }

        let request = OrderRequest {
            token_id: token_id.to_string(),
            side: Side::Sell,
            price,
            size_shares: shares,
            usd: price * shares,
            time_in_force: "GTC".to_string(),
        };
        let result = self.execute(&request, None);

        if result.success {
            let fee = price * shares * self.fee_rate;
            let state = self.inner.lock();
            let pnl = state
                .trades
                .last()
                .and_then(|t| t.realized_pnl)
                .unwrap_or(0.0);
            drop(state);
            ManualSellResult {
                success: true,
                pnl,
                proceeds: price * shares - fee,
                error: None,
            }
        } else {
            ManualSellResult {
                success: false,
                pnl: 0.0,
                proceeds: 0.0,
                error: result.error.or(Some("sell rejected".to_string())),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.inner.lock().current_balance
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    pub fn position(&self, token_id: &str) -> Option<Position> {
        self.inner.lock().positions.get(token_id).cloned()
    }

    pub fn held_shares(&self, token_id: &str) -> f64 {
        self.inner
            .lock()
            .positions
            .get(token_id)
            .map(|p| p.shares)
            .unwrap_or(0.0)
    }

    pub fn trades(&self) -> Vec<PaperTrade> {
        self.inner.lock().trades.clone()
    }

    /// (realized, unrealized, balance) for the chart history.
    pub fn pnl_summary(&self) -> (f64, f64, f64) {
        let state = self.inner.lock();
        let realized: f64 = state
            .trades
            .iter()
            .filter_map(|t| t.realized_pnl)
            .sum();
        let unrealized: f64 = state.positions.values().map(|p| p.unrealized_pnl).sum();
        (realized, unrealized, state.current_balance)
    }

    pub fn stats(&self) -> PaperStats {
        let state = self.inner.lock();
        let closed: Vec<f64> = state
            .trades
            .iter()
            .filter_map(|t| t.realized_pnl)
            .collect();

        let wins: Vec<f64> = closed.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = closed.iter().copied().filter(|p| *p < 0.0).collect();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let total_trades = state.trades.len();
        let avg_trade_size = if total_trades > 0 {
            state.trades.iter().map(|t| t.usd).sum::<f64>() / total_trades as f64
        } else {
            0.0
        };

        let win_rate = if closed.is_empty() {
            0.0
        } else {
            wins.len() as f64 / closed.len() as f64
        };

        PaperStats {
            total_trades,
            wins: wins.len(),
            losses: losses.len(),
            win_rate,
            profit_factor,
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
            avg_trade_size,
            realized_pnl: closed.iter().sum(),
            unrealized_pnl: state.positions.values().map(|p| p.unrealized_pnl).sum(),
        }
    }

    pub fn snapshot(&self) -> PaperSnapshot {
        let stats = self.stats();
        let state = self.inner.lock();
        PaperSnapshot {
            starting_balance: state.starting_balance,
            current_balance: state.current_balance,
            positions: state.positions.values().cloned().collect(),
            trades: state.trades.clone(),
            stats,
        }
    }

    /// Wipe the book back to its starting balance.
    pub fn reset(&self, starting_balance: f64) {
        let mut state = self.inner.lock();
        let now = Utc::now().to_rfc3339();
        *state = PaperStateFile {
            starting_balance,
            current_balance: starting_balance,
            positions: HashMap::new(),
            trades: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.persist(&mut state);
        info!(starting_balance, "paper book reset");
    }

    fn persist(&self, state: &mut PaperStateFile) {
        state.updated_at = Utc::now().to_rfc3339();
        if let Err(e) = write_json_atomic(&self.path, state) {
            warn!(error = %e, "failed to persist paper state");
        }
    }
}

impl std::fmt::Debug for PaperBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PaperBook")
            .field("balance", &state.current_balance)
            .field("positions", &state.positions.len())
            .field("trades", &state.trades.len())
            .finish()
    }
}
