// =============================================================================
// Mirror — Polymarket Copy-Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts with dry-run and paper trading on for safety. Live
// submission requires turning both off explicitly through the config API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounts;
mod activity;
mod api;
mod app_state;
mod chart_history;
mod control;
mod events;
mod executor;
mod paper;
mod polymarket;
mod risk;
mod runtime_config;
mod sizing;
mod state_store;
mod supervisor;
mod token_resolver;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiContext;
use crate::app_state::AppState;
use crate::runtime_config::AppConfig;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Mirror Copy-Trading Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let data_dir = PathBuf::from(
        std::env::var("MIRROR_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
    );
    std::fs::create_dir_all(&data_dir)?;
    let config_path = data_dir.join("config.json");

    let mut config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    // Override targets from env if available.
    if let Ok(targets) = std::env::var("MIRROR_TARGETS") {
        config.targets = targets
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        config.normalize_targets();
    }

    info!(
        targets = config.targets.len(),
        sizing_mode = %config.trading.sizing_mode,
        dry_run = config.risk.dry_run,
        paper = config.paper_trading.enabled,
        "engine configuration"
    );
    if config.is_live() {
        warn!("LIVE mode configured — real orders will be submitted");
    }

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, config_path.clone(), data_dir)?);
    let supervisor = Arc::new(Supervisor::new(state.clone()));

    // ── 3. Start the API server ──────────────────────────────────────────
    let bind_addr =
        std::env::var("MIRROR_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let api_context = ApiContext {
        state: state.clone(),
        supervisor: supervisor.clone(),
    };
    let api_bind = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_context);
        let listener = tokio::net::TcpListener::bind(&api_bind)
            .await
            .expect("failed to bind API server");
        info!(addr = %api_bind, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 4. Start the engine ──────────────────────────────────────────────
    if let Err(e) = supervisor.start().await {
        error!(error = %e, "engine failed to start — fix the configuration and POST /api/v1/bot/start");
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = supervisor.stop().await {
        error!(error = %e, "supervisor stop failed");
    }
    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Mirror engine shut down complete.");
    Ok(())
}
