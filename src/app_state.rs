// =============================================================================
// Central Application State — Mirror Copy-Trading Engine
// =============================================================================
//
// The single source of truth for the engine. All subsystems hold Arc
// references to their own state; AppState ties them together and provides a
// unified snapshot for the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking and metrics.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::accounts::AccountsStore;
use crate::activity::StreamMetrics;
use crate::chart_history::{ChartHistory, ChartSnapshot};
use crate::events::EventBus;
use crate::executor::ExecutorHandle;
use crate::paper::{PaperBook, PaperStats, PaperTrade};
use crate::polymarket::{ClobCredentials, PolymarketClient};
use crate::runtime_config::AppConfig;
use crate::state_store::StateStore;
use crate::token_resolver::TokenResolver;
use crate::types::{Position, RunState, SkipReason, TradeRecord};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of trade-log rows to retain in memory.
const MAX_RECENT_TRADES: usize = 200;

// =============================================================================
// Metrics
// =============================================================================

/// Pipeline counters surfaced through `bot.status`.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Signals that survived the ingress gate.
    pub detected: AtomicU64,
    /// Orders that executed successfully.
    pub copied: AtomicU64,
    /// Signals declined by policy or preflight.
    pub skipped: AtomicU64,
    /// Failed executions.
    pub errors: AtomicU64,
    skip_reasons: Mutex<HashMap<String, u64>>,
}

impl EngineMetrics {
    pub fn record_skip(&self, reason: SkipReason) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        *self
            .skip_reasons
            .lock()
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            detected: self.detected.load(Ordering::Relaxed),
            copied: self.copied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skip_reasons: self.skip_reasons.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub detected: u64,
    pub copied: u64,
    pub skipped: u64,
    pub errors: u64,
    pub skip_reasons: HashMap<String, u64>,
}

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation; the WebSocket feed uses it to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: Arc<RwLock<AppConfig>>,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub client: Arc<PolymarketClient>,
    pub store: Arc<StateStore>,
    pub resolver: Arc<TokenResolver>,
    pub paper: Arc<PaperBook>,
    pub chart: Arc<ChartHistory>,
    pub accounts: Arc<AccountsStore>,

    // ── Event fan-out ───────────────────────────────────────────────────
    pub events: EventBus,

    // ── Metrics ─────────────────────────────────────────────────────────
    pub metrics: Arc<EngineMetrics>,
    pub stream_metrics: Arc<StreamMetrics>,

    // ── Run state ───────────────────────────────────────────────────────
    pub run_state: RwLock<RunState>,
    pub connected: RwLock<bool>,

    /// Set while the supervisor is running; orders route through it.
    pub executor: RwLock<Option<ExecutorHandle>>,

    // ── Dashboard ring buffers ──────────────────────────────────────────
    pub recent_trades: RwLock<Vec<TradeRecord>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full engine state from configuration.
    pub fn new(config: AppConfig, config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let accounts = Arc::new(AccountsStore::open(&data_dir)?);

        // Wallet address: environment first, then the active account.
        let wallet_address = std::env::var("POLYMARKET_WALLET_ADDRESS")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| accounts.active_account().map(|a| a.address));

        let client = Arc::new(PolymarketClient::new(
            ClobCredentials::from_env(),
            wallet_address,
        ));
        let store = Arc::new(StateStore::open(&data_dir)?);
        let resolver = Arc::new(TokenResolver::open(client.clone(), &data_dir)?);
        let paper = Arc::new(PaperBook::open(
            &data_dir,
            config.paper_trading.starting_balance,
            config.paper_trading.fee_rate,
        )?);
        let chart = Arc::new(ChartHistory::open(&data_dir)?);

        Ok(Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(config)),
            config_path,
            data_dir,
            client,
            store,
            resolver,
            paper,
            chart,
            accounts,
            events: EventBus::new(),
            metrics: Arc::new(EngineMetrics::default()),
            stream_metrics: Arc::new(StreamMetrics::default()),
            run_state: RwLock::new(RunState::Stopped),
            connected: RwLock::new(false),
            executor: RwLock::new(None),
            recent_trades: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Run state ───────────────────────────────────────────────────────

    pub fn set_run_state(&self, state: RunState) {
        *self.run_state.write() = state;
        debug!(state = %state, "run state changed");
        self.increment_version();
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.write() = connected;
        self.increment_version();
    }

    // ── Ring buffers ────────────────────────────────────────────────────

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        self.increment_version();
    }

    pub fn push_trade_record(&self, record: TradeRecord) {
        let mut trades = self.recent_trades.write();
        trades.push(record);
        while trades.len() > MAX_RECENT_TRADES {
            trades.remove(0);
        }
        drop(trades);
        self.increment_version();
    }

    // ── Snapshot builders ───────────────────────────────────────────────

    /// `bot.status` payload.
    pub fn build_status(&self) -> BotStatus {
        let config = self.config.read();
        BotStatus {
            running: self.run_state.read().is_running(),
            connected: *self.connected.read(),
            state: *self.run_state.read(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            targets: config.targets.len(),
            dry_run: config.risk.dry_run,
            paper_trading: config.paper_trading.enabled,
            stream_messages: self
                .stream_metrics
                .messages_total
                .load(Ordering::Relaxed),
            stream_matches: self
                .stream_metrics
                .target_matches_total
                .load(Ordering::Relaxed),
            stream_dropped: self
                .stream_metrics
                .dropped_total
                .load(Ordering::Relaxed),
            stats: self.metrics.snapshot(),
        }
    }

    /// Positions for `portfolio.get`: the paper book in paper mode, live
    /// holdings otherwise.
    pub fn portfolio_positions(&self) -> Vec<Position> {
        if self.config.read().paper_trading.enabled {
            self.paper.positions()
        } else {
            self.store.snapshot_positions()
        }
    }

    /// Full engine snapshot for the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            status: self.build_status(),
            positions: self.portfolio_positions(),
            paper_balance: self.paper.balance(),
            paper_stats: self.paper.stats(),
            recent_trades: self.recent_trades.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            config: self.config.read().clone(),
        }
    }

    /// `performance.get` payload.
    pub fn build_performance(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            stats: self.paper.stats(),
            chart: self.chart.snapshots(),
            paper_trades: self.paper.trades(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("run_state", &*self.run_state.read())
            .field("version", &self.current_state_version())
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// `bot.status` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub running: bool,
    pub connected: bool,
    pub state: RunState,
    pub uptime_secs: u64,
    pub targets: usize,
    pub dry_run: bool,
    pub paper_trading: bool,
    pub stream_messages: u64,
    pub stream_matches: u64,
    pub stream_dropped: u64,
    pub stats: MetricsSnapshot,
}

/// Full engine state pushed over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub status: BotStatus,
    pub positions: Vec<Position>,
    pub paper_balance: f64,
    pub paper_stats: PaperStats,
    pub recent_trades: Vec<TradeRecord>,
    pub recent_errors: Vec<ErrorRecord>,
    pub config: AppConfig,
}

/// `performance.get` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub stats: PaperStats,
    pub chart: Vec<ChartSnapshot>,
    pub paper_trades: Vec<PaperTrade>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (AppState, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-app-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let state = AppState::new(
            AppConfig::default(),
            dir.join("config.json"),
            dir.clone(),
        )
        .unwrap();
        (state, dir)
    }

    #[test]
    fn status_reflects_defaults() {
        let (state, dir) = state();
        let status = state.build_status();
        assert!(!status.running);
        assert!(!status.connected);
        assert!(status.dry_run);
        assert!(status.paper_trading);
        assert_eq!(status.targets, 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn error_ring_buffer_is_capped() {
        let (state, dir) = state();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors[0].message.contains("10"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn metrics_skip_reasons_accumulate() {
        let (state, dir) = state();
        state.metrics.record_skip(SkipReason::CapPerTrade);
        state.metrics.record_skip(SkipReason::CapPerTrade);
        state.metrics.record_skip(SkipReason::UnresolvedToken);

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.skipped, 3);
        assert_eq!(snapshot.skip_reasons["cap_per_trade"], 2);
        assert_eq!(snapshot.skip_reasons["unresolved_token"], 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn version_increments_on_mutation() {
        let (state, dir) = state();
        let v0 = state.current_state_version();
        state.set_run_state(RunState::Streaming);
        assert!(state.current_state_version() > v0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let (state, dir) = state();
        let json = serde_json::to_string(&state.build_snapshot()).unwrap();
        assert!(json.contains("\"stateVersion\""));
        assert!(json.contains("\"paperBalance\""));
        assert!(json.contains("\"recentTrades\""));
        let _ = std::fs::remove_dir_all(dir);
    }
}
