// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The command surface the UI drives. All endpoints live under `/api/v1/`;
// `/health` is public, everything else requires the Bearer token checked by
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::runtime_config::{is_wallet_address, AppConfig};
use crate::supervisor::Supervisor;

/// Shared handler context.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub supervisor: Arc<Supervisor>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(context: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Lifecycle ───────────────────────────────────────────────
        .route("/api/v1/bot/start", post(bot_start))
        .route("/api/v1/bot/stop", post(bot_stop))
        .route("/api/v1/bot/restart", post(bot_restart))
        .route("/api/v1/bot/status", get(bot_status))
        // ── Configuration ───────────────────────────────────────────
        .route("/api/v1/config", get(config_get))
        .route("/api/v1/config", put(config_set))
        .route("/api/v1/config/:section", patch(config_update))
        // ── Targets ─────────────────────────────────────────────────
        .route("/api/v1/targets", post(targets_add))
        .route("/api/v1/targets/:address", delete(targets_remove))
        // ── Reads ───────────────────────────────────────────────────
        .route("/api/v1/stats", get(stats_get))
        .route("/api/v1/portfolio", get(portfolio_get))
        .route("/api/v1/trades", get(trades_get))
        .route("/api/v1/performance", get(performance_get))
        // ── Accounts ────────────────────────────────────────────────
        .route("/api/v1/accounts", get(accounts_get))
        .route("/api/v1/accounts", post(accounts_add))
        .route("/api/v1/accounts/:id/activate", post(accounts_activate))
        .route("/api/v1/accounts/paper-popup-seen", post(paper_popup_seen))
        // ── Paper position management ───────────────────────────────
        .route("/api/v1/positions/:token_id/sell", post(position_sell))
        .route("/api/v1/paper/reset", post(paper_reset))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(context)
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "stateVersion": ctx.state.current_state_version(),
        "serverTime": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Lifecycle
// =============================================================================

async fn bot_start(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.supervisor.start().await.map_err(|e| {
        warn!(error = %e, "bot.start failed");
        bad_request(e)
    })?;
    Ok(Json(ctx.state.build_status()))
}

async fn bot_stop(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.supervisor.stop().await.map_err(|e| bad_request(e))?;
    Ok(Json(ctx.state.build_status()))
}

async fn bot_restart(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.supervisor.restart().await.map_err(|e| {
        warn!(error = %e, "bot.restart failed");
        bad_request(e)
    })?;
    Ok(Json(ctx.state.build_status()))
}

async fn bot_status(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_status())
}

// =============================================================================
// Configuration
// =============================================================================

async fn config_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.config.read().clone())
}

async fn config_set(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(mut new_config): Json<AppConfig>,
) -> Result<impl IntoResponse, ApiError> {
    new_config.normalize_targets();
    new_config.validate().map_err(|e| bad_request(e))?;

    apply_config(&ctx.state, new_config.clone());
    info!("config replaced via API");
    Ok(Json(new_config))
}

/// PATCH one section (`trading`, `risk`, `polling`, `stopLoss`,
/// `autoRedeem`, `paperTrading`) with a shallow JSON merge.
async fn config_update(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(section): Path<String>,
    Json(patch): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let current = ctx.state.config.read().clone();
    let mut tree =
        serde_json::to_value(&current).map_err(|e| bad_request(format!("config encode: {e}")))?;

    let Some(target) = tree.get_mut(&section) else {
        return Err(bad_request(format!("unknown config section '{section}'")));
    };
    let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) else {
        return Err(bad_request("patch body must be a JSON object"));
    };
    for (key, value) in patch_map {
        target_map.insert(key.clone(), value.clone());
    }

    let mut merged: AppConfig =
        serde_json::from_value(tree).map_err(|e| bad_request(format!("invalid patch: {e}")))?;
    merged.normalize_targets();
    merged.validate().map_err(|e| bad_request(e))?;

    apply_config(&ctx.state, merged.clone());
    info!(section = %section, "config section updated via API");
    Ok(Json(merged))
}

fn apply_config(state: &AppState, config: AppConfig) {
    if let Err(e) = config.save(&state.config_path) {
        warn!(error = %e, "failed to persist config");
    }
    *state.config.write() = config;
    state.increment_version();
}

// =============================================================================
// Targets
// =============================================================================

#[derive(Deserialize)]
struct TargetRequest {
    address: String,
}

async fn targets_add(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(req): Json<TargetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = req.address.trim().to_lowercase();
    if !is_wallet_address(&address) {
        return Err(bad_request(format!(
            "'{}' is not a 0x-prefixed 40-hex-digit address",
            req.address
        )));
    }

    let config = {
        let mut config = ctx.state.config.write();
        if !config.targets.contains(&address) {
            config.targets.push(address.clone());
        }
        config.clone()
    };
    apply_config(&ctx.state, config.clone());

    info!(address = %address, "target added (effective on restart)");
    Ok(Json(config.targets))
}

async fn targets_remove(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = address.trim().to_lowercase();
    let config = {
        let mut config = ctx.state.config.write();
        config.targets.retain(|t| t != &address);
        config.clone()
    };
    apply_config(&ctx.state, config.clone());

    info!(address = %address, "target removed (effective on restart)");
    Json(config.targets)
}

// =============================================================================
// Reads
// =============================================================================

async fn stats_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "engine": ctx.state.metrics.snapshot(),
        "paper": ctx.state.paper.stats(),
    }))
}

async fn portfolio_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "positions": ctx.state.portfolio_positions(),
        "paperBalance": ctx.state.paper.balance(),
    }))
}

async fn trades_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "trades": ctx.state.recent_trades.read().clone(),
    }))
}

async fn performance_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_performance())
}

// =============================================================================
// Accounts
// =============================================================================

async fn accounts_get(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.accounts.snapshot())
}

#[derive(Deserialize)]
struct AccountRequest {
    label: String,
    address: String,
}

async fn accounts_add(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(req): Json<AccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_wallet_address(&req.address.trim().to_lowercase()) {
        return Err(bad_request(format!(
            "'{}' is not a 0x-prefixed 40-hex-digit address",
            req.address
        )));
    }
    let record = ctx.state.accounts.add_account(&req.label, &req.address);
    ctx.state.increment_version();
    Ok(Json(record))
}

async fn accounts_activate(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !ctx.state.accounts.set_active(&id) {
        return Err(bad_request(format!("no account with id '{id}'")));
    }
    ctx.state.increment_version();
    Ok(Json(ctx.state.accounts.snapshot()))
}

async fn paper_popup_seen(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.accounts.mark_paper_popup_seen();
    Json(ctx.state.accounts.snapshot())
}

// =============================================================================
// Paper position management
// =============================================================================

async fn position_sell(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(token_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !ctx.state.config.read().paper_trading.enabled {
        return Err(bad_request("position.sell is only available in paper mode"));
    }

    let result = ctx.state.paper.sell_position(&token_id);
    if result.success {
        ctx.state.increment_version();
    }
    Ok(Json(result))
}

/// Wipe the paper book back to the configured starting balance.
async fn paper_reset(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
) -> impl IntoResponse {
    let starting_balance = ctx.state.config.read().paper_trading.starting_balance;
    ctx.state.paper.reset(starting_balance);
    ctx.state.increment_version();
    Json(ctx.state.paper.snapshot())
}
