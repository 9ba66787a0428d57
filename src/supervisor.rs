// =============================================================================
// Supervisor — lifecycle, source failover, and the copy pipeline
// =============================================================================
//
// Owns the wiring: stream + poller → ingress channel → dedup gate →
// normalizer → risk gate → sizing → executor queue, plus the three control
// loops and the chart recorder. Publishes engine events to the UI bus.
//
// State machine:
//   stopped → starting → running(streaming | polling | degraded)
//           → stopping → stopped
//
// Failover: the poller is enabled whenever the stream has not been connected
// for 5 s and disabled the moment it reconnects. If the stream exhausts its
// reconnect attempts the engine degrades to poll-only until a manual
// restart.
//
// Stop is cooperative: the shutdown flag flips, watchers exit and drop their
// ingress senders, the pipeline drains, dropping the executor handle closes
// the order queue, and the worker finishes any in-flight order inside a 3 s
// grace window before state is flushed.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::activity::ingress::DedupGate;
use crate::activity::normalizer::normalize;
use crate::activity::poll::run_poller;
use crate::activity::stream::{run_activity_stream, StreamStatus};
use crate::app_state::AppState;
use crate::control::auto_redeem::run_auto_redeem;
use crate::control::price_refresh::run_price_refresh;
use crate::control::stop_loss::run_stop_loss;
use crate::events::EngineEvent;
use crate::executor::{Executor, ExecutorHandle, Reservation};
use crate::risk::{self, RiskContext};
use crate::sizing;
use crate::types::{now_ms, RunState, Signal, SkipReason, TradeRecord};

/// Capacity of the raw-activity ingress channel.
const INGRESS_CAPACITY: usize = 1_024;

/// How long the stream may be down before the poller takes over.
const FAILOVER_GRACE: Duration = Duration::from_secs(5);

/// Executor drain allowance on stop.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Chart snapshot cadence.
const CHART_INTERVAL: Duration = Duration::from_secs(60);

struct RunningTasks {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    executor_worker: JoinHandle<()>,
}

/// Engine lifecycle owner.
pub struct Supervisor {
    state: Arc<AppState>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl Supervisor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            running: tokio::sync::Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the engine. Fails when already running or the configuration is
    /// invalid; the error names the offending key.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            bail!("engine is already running");
        }

        let config = self.state.config.read().clone();
        config.validate()?;

        if config.is_live() && !self.state.client.has_credentials() {
            bail!(
                "live mode requires POLYMARKET_CLOB_API_KEY / POLYMARKET_CLOB_SECRET / \
                 POLYMARKET_CLOB_PASSPHRASE and POLYMARKET_WALLET_ADDRESS"
            );
        }
        if config.targets.is_empty() {
            warn!("starting with no target wallets configured");
        }

        self.state.set_run_state(RunState::Starting);
        info!(
            targets = config.targets.len(),
            dry_run = config.risk.dry_run,
            paper = config.paper_trading.enabled,
            "engine starting"
        );

        // ── Channels ────────────────────────────────────────────────────
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        let (poll_enabled_tx, poll_enabled_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(StreamStatus::Connecting);

        // ── Executor worker ─────────────────────────────────────────────
        let executor = Arc::new(Executor::new(
            self.state.client.clone(),
            self.state.paper.clone(),
            self.state.store.clone(),
            self.state.config.clone(),
        ));
        let (executor_handle, executor_worker) = executor.spawn();
        *self.state.executor.write() = Some(executor_handle.clone());

        let targets: HashSet<String> = config.targets.iter().cloned().collect();
        let mut tasks = Vec::new();

        // ── Activity stream ─────────────────────────────────────────────
        tasks.push(tokio::spawn(run_activity_stream(
            targets.clone(),
            ingress_tx.clone(),
            status_tx,
            self.state.stream_metrics.clone(),
            shutdown_rx.clone(),
        )));

        // ── Poller (gated by the failover task) ─────────────────────────
        tasks.push(tokio::spawn(run_poller(
            self.state.client.clone(),
            self.state.store.clone(),
            config.targets.clone(),
            config.polling.clone(),
            ingress_tx,
            poll_enabled_rx,
            shutdown_rx.clone(),
        )));

        // ── Failover ────────────────────────────────────────────────────
        tasks.push(tokio::spawn(run_failover(
            self.state.clone(),
            status_rx,
            poll_enabled_tx,
            shutdown_rx.clone(),
        )));

        // ── Pipeline ────────────────────────────────────────────────────
        tasks.push(tokio::spawn(run_pipeline(
            self.state.clone(),
            executor_handle.clone(),
            ingress_rx,
        )));

        // ── Control loops ───────────────────────────────────────────────
        tasks.push(tokio::spawn(run_stop_loss(
            self.state.store.clone(),
            self.state.resolver.clone(),
            executor_handle,
            self.state.config.clone(),
            self.state.events.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_auto_redeem(
            self.state.store.clone(),
            self.state.resolver.clone(),
            self.state.client.clone(),
            self.state.config.clone(),
            self.state.events.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_price_refresh(
            self.state.paper.clone(),
            self.state.resolver.clone(),
            self.state.config.clone(),
            self.state.events.clone(),
            shutdown_rx.clone(),
        )));

        // ── Chart recorder ──────────────────────────────────────────────
        tasks.push(tokio::spawn(run_chart_recorder(
            self.state.clone(),
            shutdown_rx,
        )));

        *running = Some(RunningTasks {
            shutdown_tx,
            tasks,
            executor_worker,
        });

        self.state.events.publish(EngineEvent::Log {
            level: "info".to_string(),
            message: "engine started".to_string(),
        });
        Ok(())
    }

    /// Stop the engine: signal shutdown, drain the executor inside the grace
    /// window, flush state.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };

        self.state.set_run_state(RunState::Stopping);
        info!("engine stopping");

        let _ = run.shutdown_tx.send(true);

        // Watchers, pipeline, and control loops exit on the shutdown flag;
        // their ingress senders and executor handles drop with them.
        for mut task in run.tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("task did not stop inside the grace window — aborting");
                task.abort();
            }
        }

        // Dropping the last executor handle closes the queue; the worker
        // drains any in-flight order and exits.
        *self.state.executor.write() = None;
        let mut worker = run.executor_worker;
        if tokio::time::timeout(STOP_GRACE, &mut worker).await.is_err() {
            warn!("executor did not drain inside the grace window");
            worker.abort();
        }

        if let Err(e) = self.state.store.flush() {
            error!(error = %e, "state flush failed on stop");
        }

        self.state.set_connected(false);
        self.state.set_run_state(RunState::Stopped);
        self.state.events.publish(EngineEvent::Log {
            level: "info".to_string(),
            message: "engine stopped".to_string(),
        });
        info!("engine stopped");
        Ok(())
    }

    /// Tear down and re-wire. Picks up target-wallet changes.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("run_state", &*self.state.run_state.read())
            .finish()
    }
}

// =============================================================================
// Failover
// =============================================================================

/// Track the stream's connection state, flip the poller on 5 s of downtime,
/// and keep the run-state gauge honest.
async fn run_failover(
    state: Arc<AppState>,
    mut status_rx: watch::Receiver<StreamStatus>,
    poll_enabled_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut grace: Option<tokio::time::Instant> = Some(tokio::time::Instant::now() + FAILOVER_GRACE);

    loop {
        let status = *status_rx.borrow();

        match status {
            StreamStatus::Connected => {
                grace = None;
                if !*state.connected.read() {
                    state.set_connected(true);
                    state.set_run_state(RunState::Streaming);
                    let _ = poll_enabled_tx.send(false);
                    state.events.publish(EngineEvent::Connected);
                    info!("stream connected — polling disabled");
                }
            }
            StreamStatus::Degraded => {
                grace = None;
                if *state.connected.read() {
                    state.set_connected(false);
                    state.events.publish(EngineEvent::Disconnected {
                        reason: "stream degraded".to_string(),
                    });
                }
                state.set_run_state(RunState::Degraded);
                let _ = poll_enabled_tx.send(true);
                warn!("stream degraded — poll-only until restart");
            }
            StreamStatus::Connecting | StreamStatus::Disconnected => {
                if *state.connected.read() {
                    state.set_connected(false);
                    state.events.publish(EngineEvent::Disconnected {
                        reason: "stream disconnected".to_string(),
                    });
                }
                // Arm the takeover timer once per outage.
                if grace.is_none() && !*poll_enabled_tx.borrow() {
                    grace = Some(tokio::time::Instant::now() + FAILOVER_GRACE);
                }
            }
        }

        // Wait for a status change, the grace deadline, or shutdown. A
        // closed status channel means the stream task is gone for good
        // (shutdown or degraded); the failover's work is done.
        if let Some(deadline) = grace {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    grace = None;
                    if *status_rx.borrow() != StreamStatus::Connected {
                        state.set_run_state(RunState::Polling);
                        let _ = poll_enabled_tx.send(true);
                        info!("stream down past grace window — polling enabled");
                    }
                }
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Drain the ingress channel: dedup, normalize, gate, size, execute.
async fn run_pipeline(
    state: Arc<AppState>,
    executor: ExecutorHandle,
    mut ingress_rx: mpsc::Receiver<crate::polymarket::RawActivity>,
) {
    let gate = DedupGate::new(state.store.clone());
    info!("copy pipeline running");

    while let Some(raw) = ingress_rx.recv().await {
        let Some(signal) = normalize(&raw) else {
            continue;
        };

        match gate.admit(&signal.target_wallet, &signal.trade_id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                // A failing seen-set write is a disk problem; surface it but
                // do not double-process the trade.
                state.push_error(format!("dedup persistence failed: {e}"));
                continue;
            }
        }

        state.metrics.detected.fetch_add(1, Ordering::Relaxed);
        state.events.publish(EngineEvent::TradeDetected {
            signal: signal.clone(),
        });

        handle_signal(&state, &executor, signal).await;
    }

    info!("copy pipeline drained");
}

/// Risk-gate, size, and execute one detected signal.
async fn handle_signal(state: &Arc<AppState>, executor: &ExecutorHandle, signal: Signal) {
    let config = state.config.read().clone();

    // Resolve the tradable token.
    let token_id = match state.resolver.resolve(&signal).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            record_skip(state, &signal, None, SkipReason::UnresolvedToken);
            return;
        }
        Err(e) => {
            warn!(trade_id = %signal.trade_id, error = %e, "token resolution failed");
            record_skip(state, &signal, None, SkipReason::UnresolvedToken);
            return;
        }
    };

    // Size the order.
    let Some(order) = sizing::build_order(&signal, &token_id, &config.trading) else {
        record_skip(state, &signal, None, SkipReason::UnsupportedActivity);
        return;
    };

    // Resolution timestamp only matters when the proximity rule is armed.
    let resolution_ts_ms = if config.risk.do_not_trade_within_seconds_of_resolution > 0 {
        match signal.condition_id.as_deref() {
            Some(condition_id) => state
                .resolver
                .market_for_condition(condition_id)
                .await
                .ok()
                .flatten()
                .and_then(|m| m.end_date_ms()),
            None => None,
        }
    } else {
        None
    };

    let ctx = RiskContext {
        projected_usd: order.usd,
        per_market_usd: signal
            .condition_id
            .as_deref()
            .map(|c| state.store.market_exposure(c))
            .unwrap_or(0.0),
        daily_volume_usd: state.store.daily_volume(),
        resolution_ts_ms,
        has_credentials: state.client.has_credentials(),
        paper_mode: config.paper_trading.enabled,
        now_ms: now_ms(),
    };

    match risk::evaluate(&signal, &ctx, &config.risk) {
        risk::Decision::Skip(reason) => {
            record_skip(state, &signal, Some(&order), reason);
        }
        risk::Decision::Allow => {
            let reservation = Reservation {
                condition_id: signal.condition_id.clone(),
                usd: order.usd,
            };
            state
                .store
                .reserve_exposure(reservation.condition_id.as_deref(), reservation.usd);

            let order_for_record = order.clone();
            match executor
                .submit_and_wait(order, Some(signal.clone()), Some(reservation))
                .await
            {
                Ok(result) if result.success => {
                    state.metrics.copied.fetch_add(1, Ordering::Relaxed);
                    let mut record =
                        trade_record(&signal, Some(&order_for_record), "copied", None);
                    record.order_id = result.order_id.clone();
                    state.push_trade_record(record.clone());
                    state
                        .events
                        .publish(EngineEvent::TradeExecuted { record, result });
                }
                Ok(result) => {
                    if let Some(reason) = result.skip_reason {
                        record_skip(state, &signal, Some(&order_for_record), reason);
                    } else {
                        let message = result
                            .error
                            .unwrap_or_else(|| "order failed without detail".to_string());
                        state.push_error(message.clone());
                        state.push_trade_record(trade_record(
                            &signal,
                            Some(&order_for_record),
                            "failed",
                            Some(message.clone()),
                        ));
                        state.events.publish(EngineEvent::Error { message });
                    }
                }
                Err(e) => {
                    state.push_error(format!("executor unavailable: {e}"));
                }
            }
        }
    }
}

fn record_skip(
    state: &Arc<AppState>,
    signal: &Signal,
    order: Option<&crate::types::OrderRequest>,
    reason: SkipReason,
) {
    state.metrics.record_skip(reason);
    let record = trade_record(signal, order, "skipped", Some(reason.as_str().to_string()));
    state.push_trade_record(record.clone());
    state
        .events
        .publish(EngineEvent::TradeSkipped { record, reason });
}

fn trade_record(
    signal: &Signal,
    order: Option<&crate::types::OrderRequest>,
    status: &str,
    reason: Option<String>,
) -> TradeRecord {
    TradeRecord {
        id: signal.trade_id.clone(),
        timestamp_ms: signal.timestamp_ms,
        target_wallet: signal.target_wallet.clone(),
        market_slug: signal.market_slug.clone(),
        market_title: signal.market_title.clone(),
        token_id: order
            .map(|o| o.token_id.clone())
            .unwrap_or_else(|| signal.token_id.clone()),
        side: signal.side,
        price: order.map(|o| o.price).unwrap_or(signal.price),
        shares: order.map(|o| o.size_shares).unwrap_or(0.0),
        usd: order.map(|o| o.usd).unwrap_or(0.0),
        status: status.to_string(),
        reason,
        order_id: None,
    }
}

// =============================================================================
// Chart recorder
// =============================================================================

/// Record a P&L snapshot every minute while paper trading.
async fn run_chart_recorder(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CHART_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if !state.config.read().paper_trading.enabled {
                    continue;
                }
                let (realized, unrealized, balance) = state.paper.pnl_summary();
                state.chart.record(realized, unrealized, balance);
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
    use crate::runtime_config::AppConfig;
    use crate::types::{ActivityType, Outcome, Side};
    use std::path::PathBuf;

    fn test_state(mut mutate: impl FnMut(&mut AppConfig)) -> (Arc<AppState>, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-sup-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = AppConfig::default();
        mutate(&mut config);
        let state = Arc::new(
            AppState::new(config, dir.join("config.json"), dir.clone()).unwrap(),
        );
        (state, dir)
    }

    fn signal(trade_id: &str, price: f64, size: f64) -> Signal {
        Signal {
            target_wallet: "0xabc".to_string(),
            trade_id: trade_id.to_string(),
            timestamp_ms: now_ms(),
            token_id: "11111111111111111111111".to_string(),
            condition_id: Some("0xcond".to_string()),
            market_slug: Some("will-it-rain".to_string()),
            market_title: None,
            side: Side::Buy,
            price,
            size_shares: Some(size),
            notional_usd: Some(price * size),
            outcome: Some(Outcome::Yes),
            activity_type: ActivityType::Trade,
        }
    }

    async fn pipeline_executor(state: &Arc<AppState>) -> (ExecutorHandle, JoinHandle<()>) {
        let executor = Arc::new(Executor::new(
            state.client.clone(),
            state.paper.clone(),
            state.store.clone(),
            state.config.clone(),
        ));
        executor.spawn()
    }

    #[tokio::test]
    async fn allowed_signal_is_copied_and_recorded() {
        let (state, dir) = test_state(|_| {});
        let (handle, worker) = pipeline_executor(&state).await;

        handle_signal(&state, &handle, signal("t1", 0.5, 200.0)).await;

        assert_eq!(state.metrics.snapshot().copied, 1);
        let trades = state.recent_trades.read();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, "copied");
        assert!(trades[0].order_id.as_deref().unwrap().starts_with("DRY_RUN_"));
        drop(trades);

        // Dry-run execution still commits the exposure reservation.
        assert!(state.store.daily_volume() > 0.0);

        drop(handle);
        *state.executor.write() = None;
        worker.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn risk_cap_skips_without_executor_side_effects() {
        // An order over the per-trade cap never reaches the executor and
        // leaves the ledger untouched.
        let (state, dir) = test_state(|cfg| {
            cfg.risk.max_usd_per_trade = 5.0;
            cfg.trading.sizing_mode = crate::runtime_config::SizingMode::Proportional;
            cfg.trading.proportional_multiplier = 1.0;
        });
        let (handle, worker) = pipeline_executor(&state).await;

        // 15 shares at 0.5 → 7.50 projected, cap 5.00.
        handle_signal(&state, &handle, signal("t1", 0.5, 15.0)).await;

        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.copied, 0);
        assert_eq!(metrics.skip_reasons["cap_per_trade"], 1);
        assert_eq!(state.store.daily_volume(), 0.0);
        assert_eq!(state.store.market_exposure("0xcond"), 0.0);

        let trades = state.recent_trades.read();
        assert_eq!(trades[0].status, "skipped");
        assert_eq!(trades[0].reason.as_deref(), Some("cap_per_trade"));
        drop(trades);

        drop(handle);
        worker.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unresolvable_signal_skips_with_unresolved_token() {
        let (state, dir) = test_state(|_| {});
        let (handle, worker) = pipeline_executor(&state).await;

        let mut sig = signal("t1", 0.5, 10.0);
        sig.token_id = "short".to_string();
        sig.condition_id = None;
        sig.market_slug = None;
        handle_signal(&state, &handle, sig).await;

        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.skip_reasons["unresolved_token"], 1);

        drop(handle);
        worker.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn pipeline_dedups_across_sources() {
        // The same trade id delivered by both sources produces exactly one
        // executed order.
        let (state, dir) = test_state(|_| {});
        let (handle, worker) = pipeline_executor(&state).await;
        let (ingress_tx, ingress_rx) = mpsc::channel(16);

        let pipeline = tokio::spawn(run_pipeline(state.clone(), handle.clone(), ingress_rx));

        let raw = crate::polymarket::RawActivity {
            proxy_wallet: "0xabc".to_string(),
            transaction_hash: Some("0xdead".to_string()),
            timestamp: 1_700_000_000,
            asset: "11111111111111111111111".to_string(),
            condition_id: Some("0xcond".to_string()),
            slug: Some("will-it-rain".to_string()),
            title: None,
            side: Some("BUY".to_string()),
            price: 0.42,
            size: 100.0,
            outcome: Some("Yes".to_string()),
            activity_type: "TRADE".to_string(),
        };

        // Stream delivery at t=0, poll delivery shortly after.
        ingress_tx.send(raw.clone()).await.unwrap();
        ingress_tx.send(raw).await.unwrap();
        drop(ingress_tx);
        pipeline.await.unwrap();

        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.detected, 1);
        assert_eq!(metrics.copied, 1);

        drop(handle);
        worker.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn supervisor_rejects_double_start_and_bad_config() {
        let (state, dir) = test_state(|cfg| {
            cfg.targets = vec!["bogus".to_string()];
        });
        let supervisor = Supervisor::new(state);

        // Invalid target address: start refuses and names the key.
        let err = supervisor.start().await.unwrap_err().to_string();
        assert!(err.contains("targets"));
        assert!(!supervisor.is_running().await);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn start_stop_cycle() {
        let (state, dir) = test_state(|_| {});
        let supervisor = Supervisor::new(state.clone());

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running().await);
        assert_eq!(*state.run_state.read(), RunState::Stopped);
        let _ = std::fs::remove_dir_all(dir);
    }
}
