// =============================================================================
// Executor — serialized order submission with balance reservation and retry
// =============================================================================
//
// A single worker drains a bounded queue; every order in the system passes
// through it, so preflight checks can never interleave and over-commit the
// balance. Per order:
//
//   1. insufficient-balance cooldown (10 s)
//   2. hard minimums ($0.50 / 0.1 shares, raised by config)
//   3. BUY: balance preflight with a 5 s cache and a 1 % reservation buffer
//   4. SELL: holdings preflight
//   5. reserve, fetch per-market params (60 s cache), submit
//   6. retry transient errors twice (500 ms, 1 s, ±25 % jitter);
//      insufficient balance is non-retryable and arms the cooldown
//   7. on success commit the reservation; on any failure release it
//
// Dry-run short-circuits with a synthetic DRY_RUN_ id; paper mode delegates
// to the paper book. Only this worker mutates `pending_reserved`,
// `last_known`, and committed exposure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::paper::PaperBook;
use crate::polymarket::{MarketParams, PolymarketClient};
use crate::runtime_config::AppConfig;
use crate::state_store::StateStore;
use crate::types::{now_ms, OrderRequest, OrderResult, Side, Signal, SkipReason};

/// Queue depth; submissions block (briefly) when full rather than dropping.
const ORDER_QUEUE_CAPACITY: usize = 256;

/// Cooldown after an upstream insufficient-balance rejection.
const INSUFFICIENT_COOLDOWN: Duration = Duration::from_secs(10);

/// Hard order minimums; config can only raise them.
const MIN_ORDER_USD: f64 = 0.50;
const MIN_ORDER_SHARES: f64 = 0.1;

/// Balance cache freshness window.
const BALANCE_MAX_AGE: Duration = Duration::from_secs(5);
/// Reservation buffer over the order notional.
const RESERVE_BUFFER: f64 = 1.01;

/// Market-params cache TTL.
const PARAMS_TTL: Duration = Duration::from_secs(60);

/// Retry schedule for transient submission errors.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(1)];

// =============================================================================
// Job and handle
// =============================================================================

/// Exposure reservation taken by the risk gate, settled here.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub condition_id: Option<String>,
    pub usd: f64,
}

/// One unit of work for the executor worker.
pub struct OrderJob {
    pub request: OrderRequest,
    /// Present for copied trades; carries market metadata into positions.
    pub signal: Option<Signal>,
    pub reservation: Option<Reservation>,
    pub reply: Option<oneshot::Sender<OrderResult>>,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<OrderJob>,
}

impl ExecutorHandle {
    /// Queue an order and wait for its result.
    pub async fn submit_and_wait(
        &self,
        request: OrderRequest,
        signal: Option<Signal>,
        reservation: Option<Reservation>,
    ) -> Result<OrderResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OrderJob {
                request,
                signal,
                reservation,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| anyhow::anyhow!("executor queue closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("executor dropped the order"))
    }
}

// =============================================================================
// Balance state
// =============================================================================

/// Live-mode collateral tracking. Mutated only from the executor worker.
#[derive(Debug, Default)]
struct BalanceState {
    last_known: f64,
    pending_reserved: f64,
    last_fetched: Option<Instant>,
    last_insufficient: Option<Instant>,
}

impl BalanceState {
    fn available(&self) -> f64 {
        (self.last_known - self.pending_reserved).max(0.0)
    }
}

/// True while the insufficient-balance cooldown is armed.
fn cooldown_active(last_insufficient: Option<Instant>, now: Instant) -> bool {
    last_insufficient
        .map(|at| now.duration_since(at) < INSUFFICIENT_COOLDOWN)
        .unwrap_or(false)
}

// =============================================================================
// Error classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Worth retrying after a short delay.
    Transient,
    /// Arms the cooldown; never retried.
    InsufficientBalance,
    /// Everything else; fails immediately.
    Fatal,
}

fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("insufficient")
        || lower.contains("not enough balance")
        || lower.contains("allowance")
    {
        return ErrorClass::InsufficientBalance;
    }
    const TRANSIENT: [&str; 10] = [
        "timeout",
        "timed out",
        "rate limit",
        "429",
        "connection reset",
        "connection refused",
        "blocked",
        "500",
        "502",
        "503",
    ];
    if TRANSIENT.iter().any(|t| lower.contains(t)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Fatal
}

/// Apply ±25 % jitter to a retry delay.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

// =============================================================================
// Executor
// =============================================================================

pub struct Executor {
    client: Arc<PolymarketClient>,
    paper: Arc<PaperBook>,
    store: Arc<StateStore>,
    config: Arc<RwLock<AppConfig>>,
    balance: Mutex<BalanceState>,
    params_cache: Mutex<HashMap<String, (MarketParams, Instant)>>,
}

impl Executor {
    pub fn new(
        client: Arc<PolymarketClient>,
        paper: Arc<PaperBook>,
        store: Arc<StateStore>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            client,
            paper,
            store,
            config,
            balance: Mutex::new(BalanceState::default()),
            params_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the single-consumer worker. Dropping every handle closes the
    /// queue; the worker drains what is in flight and exits.
    pub fn spawn(self: Arc<Self>) -> (ExecutorHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<OrderJob>(ORDER_QUEUE_CAPACITY);

        let worker = tokio::spawn(async move {
            info!("executor worker started");
            while let Some(job) = rx.recv().await {
                let result = self.process(&job).await;
                self.settle_reservation(&job, &result);

                if let Some(reply) = job.reply {
                    let _ = reply.send(result);
                }
            }
            info!("executor worker drained and stopped");
        });

        (ExecutorHandle { tx }, worker)
    }

    // -------------------------------------------------------------------------
    // Order processing
    // -------------------------------------------------------------------------

    async fn process(&self, job: &OrderJob) -> OrderResult {
        let request = &job.request;
        let (dry_run, paper_enabled, min_usd, min_shares) = {
            let cfg = self.config.read();
            (
                cfg.risk.dry_run,
                cfg.paper_trading.enabled,
                cfg.trading.min_order_size.max(MIN_ORDER_USD),
                cfg.trading.min_order_shares.max(MIN_ORDER_SHARES),
            )
        };

        // 1. Cooldown after an upstream insufficient-balance rejection.
        if cooldown_active(self.balance.lock().last_insufficient, Instant::now()) {
            debug!(token_id = %request.token_id, "order skipped — balance cooldown armed");
            return OrderResult::skipped(SkipReason::TemporarilyPaused);
        }

        // 2. Minimums.
        if request.usd < min_usd || request.size_shares < min_shares {
            debug!(
                usd = request.usd,
                shares = request.size_shares,
                "order below minimums"
            );
            return OrderResult::skipped(SkipReason::BelowMinimum);
        }

        // 3. Simulation modes. Dry-run wins over paper.
        if dry_run {
            let order_id = format!("DRY_RUN_{}", now_ms());
            info!(
                order_id = %order_id,
                token_id = %request.token_id,
                side = %request.side,
                price = request.price,
                shares = request.size_shares,
                "dry-run order"
            );
            return OrderResult {
                success: true,
                order_id: Some(order_id),
                executed_price: Some(request.price),
                executed_size: Some(request.size_shares),
                error: None,
                skip_reason: None,
            };
        }

        if paper_enabled {
            return self.paper.execute(request, job.signal.as_ref());
        }

        self.process_live(request).await
    }

    async fn process_live(&self, request: &OrderRequest) -> OrderResult {
        let reserve = request.usd * RESERVE_BUFFER;

        match request.side {
            Side::Buy => {
                // Balance preflight against a bounded-staleness cache.
                if let Err(e) = self.refresh_balance_if_stale().await {
                    warn!(error = %e, "balance refresh failed");
                    return OrderResult::failed(format!("balance refresh failed: {e}"));
                }

                let mut balance = self.balance.lock();
                if balance.available() < reserve {
                    debug!(
                        available = balance.available(),
                        needed = reserve,
                        "BUY preflight failed — insufficient available balance"
                    );
                    return OrderResult::skipped(SkipReason::InsufficientBalance);
                }
                balance.pending_reserved += reserve;
            }
            Side::Sell => {
                // Holdings preflight.
                let held = self.store.held_shares(&request.token_id);
                if held + 1e-9 < request.size_shares {
                    debug!(
                        held,
                        requested = request.size_shares,
                        "SELL preflight failed — insufficient holdings"
                    );
                    return OrderResult::skipped(SkipReason::InsufficientHoldings);
                }
            }
        }

        let result = self.submit_with_retry(request).await;
        self.finalize_live(request, reserve, result)
    }

    /// Settle the balance reservation and record the fill.
    fn finalize_live(
        &self,
        request: &OrderRequest,
        reserve: f64,
        result: OrderResult,
    ) -> OrderResult {
        let mut balance = self.balance.lock();

        if request.side == Side::Buy {
            balance.pending_reserved = (balance.pending_reserved - reserve).max(0.0);
        }

        if result.success {
            let executed_usd = result
                .executed_price
                .unwrap_or(request.price)
                * result.executed_size.unwrap_or(request.size_shares);
            match request.side {
                Side::Buy => balance.last_known = (balance.last_known - executed_usd).max(0.0),
                Side::Sell => balance.last_known += executed_usd,
            }
            drop(balance);

            if let Err(e) = self.store.apply_fill(
                &request.token_id,
                request.side,
                result.executed_size.unwrap_or(request.size_shares),
                result.executed_price.unwrap_or(request.price),
            ) {
                warn!(error = %e, "failed to persist fill");
            }
        }

        result
    }

    /// Submit with the fixed retry schedule. Transient errors retry;
    /// insufficient balance arms the cooldown and returns immediately.
    async fn submit_with_retry(&self, request: &OrderRequest) -> OrderResult {
        let params = self.market_params(&request.token_id).await;

        let mut attempt = 0;
        loop {
            match self.client.place_order(request, &params).await {
                Ok(resp) if resp.success || resp.order_id.is_some() => {
                    let executed_price = resp
                        .avg_price
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(request.price);
                    let executed_size = resp
                        .filled_size
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(request.size_shares);

                    info!(
                        order_id = resp.order_id.as_deref().unwrap_or("?"),
                        token_id = %request.token_id,
                        side = %request.side,
                        price = executed_price,
                        shares = executed_size,
                        "order placed"
                    );

                    return OrderResult {
                        success: true,
                        order_id: resp.order_id,
                        executed_price: Some(executed_price),
                        executed_size: Some(executed_size),
                        error: None,
                        skip_reason: None,
                    };
                }
                Ok(resp) => {
                    let message = resp
                        .error_msg
                        .unwrap_or_else(|| "order rejected without reason".to_string());
                    match self.handle_submit_error(&message, attempt).await {
                        Some(result) => return result,
                        None => attempt += 1,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    match self.handle_submit_error(&message, attempt).await {
                        Some(result) => return result,
                        None => attempt += 1,
                    }
                }
            }
        }
    }

    /// `Some(result)` ends the retry loop; `None` means sleep happened and
    /// the caller should try again.
    async fn handle_submit_error(&self, message: &str, attempt: usize) -> Option<OrderResult> {
        match classify_error(message) {
            ErrorClass::InsufficientBalance => {
                warn!(error = %message, "insufficient balance — arming cooldown");
                self.balance.lock().last_insufficient = Some(Instant::now());
                Some(OrderResult {
                    success: false,
                    order_id: None,
                    executed_price: None,
                    executed_size: None,
                    error: Some(message.to_string()),
                    skip_reason: Some(SkipReason::InsufficientBalance),
                })
            }
            ErrorClass::Transient if attempt < RETRY_DELAYS.len() => {
                let delay = jittered(RETRY_DELAYS[attempt]);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient submission error — retrying"
                );
                tokio::time::sleep(delay).await;
                None
            }
            _ => {
                warn!(error = %message, "order submission failed");
                Some(OrderResult::failed(message.to_string()))
            }
        }
    }

    /// Commit or release the risk gate's exposure reservation.
    fn settle_reservation(&self, job: &OrderJob, result: &OrderResult) {
        let Some(reservation) = &job.reservation else {
            return;
        };

        if result.success {
            if let Err(e) = self.store.commit_exposure(
                reservation.condition_id.as_deref(),
                reservation.usd,
                job.request.side,
            ) {
                warn!(error = %e, "failed to commit exposure");
            }
        } else {
            self.store
                .release_exposure(reservation.condition_id.as_deref(), reservation.usd);
        }
    }

    // -------------------------------------------------------------------------
    // Caches
    // -------------------------------------------------------------------------

    async fn refresh_balance_if_stale(&self) -> Result<()> {
        let stale = {
            let balance = self.balance.lock();
            balance
                .last_fetched
                .map(|at| at.elapsed() > BALANCE_MAX_AGE)
                .unwrap_or(true)
        };
        if !stale {
            return Ok(());
        }

        let fetched = self.client.get_balance().await?;
        let mut balance = self.balance.lock();
        balance.last_known = fetched;
        balance.last_fetched = Some(Instant::now());
        debug!(balance = fetched, "balance cache refreshed");
        Ok(())
    }

    async fn market_params(&self, token_id: &str) -> MarketParams {
        {
            let cache = self.params_cache.lock();
            if let Some((params, at)) = cache.get(token_id) {
                if at.elapsed() < PARAMS_TTL {
                    return params.clone();
                }
            }
        }

        match self.client.get_market_params(token_id).await {
            Ok(params) => {
                self.params_cache
                    .lock()
                    .insert(token_id.to_string(), (params.clone(), Instant::now()));
                params
            }
            Err(e) => {
                warn!(token_id, error = %e, "market params fetch failed — using defaults");
                MarketParams::default()
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let balance = self.balance.lock();
        f.debug_struct("Executor")
            .field("last_known", &balance.last_known)
            .field("pending_reserved", &balance.pending_reserved)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixtures(dry_run: bool, paper: bool) -> (Arc<Executor>, Arc<StateStore>, Arc<PaperBook>, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-exec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut cfg = AppConfig::default();
        cfg.risk.dry_run = dry_run;
        cfg.paper_trading.enabled = paper;

        let client = Arc::new(PolymarketClient::new(None, None));
        let store = Arc::new(StateStore::open(dir.join("state")).unwrap());
        let paper_book = Arc::new(PaperBook::open(&dir, 1_000.0, 0.001).unwrap());
        let executor = Arc::new(Executor::new(
            client,
            paper_book.clone(),
            store.clone(),
            Arc::new(RwLock::new(cfg)),
        ));
        (executor, store, paper_book, dir)
    }

    fn request(price: f64, shares: f64) -> OrderRequest {
        OrderRequest {
            token_id: "tok".to_string(),
            side: Side::Buy,
            price,
            size_shares: shares,
            usd: price * shares,
            time_in_force: "GTC".to_string(),
        }
    }

    fn job(request: OrderRequest) -> OrderJob {
        OrderJob {
            request,
            signal: None,
            reservation: None,
            reply: None,
        }
    }

    #[tokio::test]
    async fn dry_run_returns_synthetic_order_id() {
        let (executor, _store, _paper, dir) = fixtures(true, false);
        let result = executor.process(&job(request(0.5, 10.0))).await;
        assert!(result.success);
        assert!(result.order_id.unwrap().starts_with("DRY_RUN_"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn below_minimum_orders_are_rejected() {
        let (executor, _store, _paper, dir) = fixtures(true, false);

        // $0.30 notional < $0.50 minimum.
        let result = executor.process(&job(request(0.3, 1.0))).await;
        assert_eq!(result.skip_reason, Some(SkipReason::BelowMinimum));

        // 0.05 shares < 0.1 minimum.
        let result = executor.process(&job(request(0.9, 0.05))).await;
        assert_eq!(result.skip_reason, Some(SkipReason::BelowMinimum));

        // $1.02 / 2 shares clears both.
        let result = executor.process(&job(request(0.51, 2.0))).await;
        assert!(result.success);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn paper_mode_routes_to_book() {
        let (executor, _store, paper, dir) = fixtures(false, true);
        let result = executor.process(&job(request(0.4, 100.0))).await;
        assert!(result.success);
        assert!(result.order_id.unwrap().starts_with("PAPER_"));
        assert_eq!(paper.held_shares("tok"), 100.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn cooldown_pauses_subsequent_orders() {
        let (executor, _store, _paper, dir) = fixtures(true, false);

        executor.balance.lock().last_insufficient = Some(Instant::now());
        let result = executor.process(&job(request(0.5, 10.0))).await;
        assert_eq!(result.skip_reason, Some(SkipReason::TemporarilyPaused));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cooldown_window_is_ten_seconds() {
        let armed = Instant::now();
        // 3 s in: still paused.
        assert!(cooldown_active(
            Some(armed),
            armed + Duration::from_secs(3)
        ));
        // 12 s in: cleared.
        assert!(!cooldown_active(
            Some(armed),
            armed + Duration::from_secs(12)
        ));
        // Never armed.
        assert!(!cooldown_active(None, Instant::now()));
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            classify_error("not enough balance / allowance"),
            ErrorClass::InsufficientBalance
        );
        assert_eq!(
            classify_error("Insufficient funds for order"),
            ErrorClass::InsufficientBalance
        );
        assert_eq!(classify_error("request timed out"), ErrorClass::Transient);
        assert_eq!(classify_error("429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(
            classify_error("connection reset by peer"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error("order is blocked"), ErrorClass::Transient);
        assert_eq!(classify_error("HTTP 503 unavailable"), ErrorClass::Transient);
        assert_eq!(classify_error("invalid token id"), ErrorClass::Fatal);
    }

    #[test]
    fn available_balance_clamps_at_zero() {
        let state = BalanceState {
            last_known: 10.0,
            pending_reserved: 25.0,
            last_fetched: None,
            last_insufficient: None,
        };
        assert_eq!(state.available(), 0.0);
    }

    #[tokio::test]
    async fn successful_execution_commits_reservation() {
        let (executor, store, _paper, dir) = fixtures(true, false);

        store.reserve_exposure(Some("cond-1"), 5.0);
        let j = OrderJob {
            request: request(0.5, 10.0),
            signal: None,
            reservation: Some(Reservation {
                condition_id: Some("cond-1".to_string()),
                usd: 5.0,
            }),
            reply: None,
        };
        let result = executor.process(&j).await;
        executor.settle_reservation(&j, &result);

        assert!(result.success);
        assert_eq!(store.market_exposure("cond-1"), 5.0);
        assert_eq!(store.daily_volume(), 5.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_execution_releases_reservation() {
        let (executor, store, _paper, dir) = fixtures(true, false);

        store.reserve_exposure(Some("cond-1"), 5.0);
        let j = OrderJob {
            // Below minimums → skipped, not executed.
            request: request(0.3, 1.0),
            signal: None,
            reservation: Some(Reservation {
                condition_id: Some("cond-1".to_string()),
                usd: 5.0,
            }),
            reply: None,
        };
        let result = executor.process(&j).await;
        executor.settle_reservation(&j, &result);

        assert!(!result.success);
        assert_eq!(store.market_exposure("cond-1"), 0.0);
        assert_eq!(store.daily_volume(), 0.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn worker_serializes_and_replies() {
        let (executor, _store, _paper, dir) = fixtures(true, false);
        let (handle, worker) = executor.spawn();

        let result = handle
            .submit_and_wait(request(0.5, 10.0), None, None)
            .await
            .unwrap();
        assert!(result.success);

        drop(handle);
        worker.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
