// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Mirror copy-trading engine. Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart (target-wallet changes take effect on the next
// supervisor restart).
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Wire names are camelCase to
// match the on-disk `config.json` format consumed by the UI.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_fixed_usd_size() -> f64 {
    10.0
}

fn default_fixed_shares_size() -> f64 {
    10.0
}

fn default_proportional_multiplier() -> f64 {
    0.01
}

fn default_slippage() -> f64 {
    0.01
}

fn default_min_order_size() -> f64 {
    0.5
}

fn default_min_order_shares() -> f64 {
    0.1
}

fn default_max_usd_per_trade() -> f64 {
    100.0
}

fn default_max_usd_per_market() -> f64 {
    500.0
}

fn default_max_daily_usd_volume() -> f64 {
    1_000.0
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_trade_limit() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_stop_loss_percent() -> f64 {
    80.0
}

fn default_stop_loss_interval_ms() -> u64 {
    30_000
}

fn default_auto_redeem_interval_ms() -> u64 {
    300_000
}

fn default_starting_balance() -> f64 {
    1_000.0
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_chain_id() -> u64 {
    137
}

// =============================================================================
// Section types
// =============================================================================

/// How a target fill is translated into our own order size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    FixedUsd,
    FixedShares,
    Proportional,
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::FixedUsd
    }
}

impl std::fmt::Display for SizingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FixedUsd => write!(f, "fixed_usd"),
            Self::FixedShares => write!(f, "fixed_shares"),
            Self::Proportional => write!(f, "proportional"),
        }
    }
}

/// Sizing parameters (§ trading section of config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingConfig {
    #[serde(default)]
    pub sizing_mode: SizingMode,

    /// Notional per copied trade in fixed_usd mode.
    #[serde(default = "default_fixed_usd_size")]
    pub fixed_usd_size: f64,

    /// Shares per copied trade in fixed_shares mode.
    #[serde(default = "default_fixed_shares_size")]
    pub fixed_shares_size: f64,

    /// Fraction of the target's size copied in proportional mode.
    #[serde(default = "default_proportional_multiplier")]
    pub proportional_multiplier: f64,

    /// Limit-price cushion relative to the observed fill (0.01 = 1 %).
    #[serde(default = "default_slippage")]
    pub slippage: f64,

    /// Minimum order notional in USD.
    #[serde(default = "default_min_order_size")]
    pub min_order_size: f64,

    /// Minimum order size in shares.
    #[serde(default = "default_min_order_shares")]
    pub min_order_shares: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            sizing_mode: SizingMode::default(),
            fixed_usd_size: default_fixed_usd_size(),
            fixed_shares_size: default_fixed_shares_size(),
            proportional_multiplier: default_proportional_multiplier(),
            slippage: default_slippage(),
            min_order_size: default_min_order_size(),
            min_order_shares: default_min_order_shares(),
        }
    }
}

/// Pre-trade risk caps (§ risk section of config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskConfig {
    #[serde(default = "default_max_usd_per_trade")]
    pub max_usd_per_trade: f64,

    #[serde(default = "default_max_usd_per_market")]
    pub max_usd_per_market: f64,

    #[serde(default = "default_max_daily_usd_volume")]
    pub max_daily_usd_volume: f64,

    /// When > 0, trades on markets resolving within this many seconds are
    /// skipped.
    #[serde(default)]
    pub do_not_trade_within_seconds_of_resolution: u64,

    /// When non-empty, only markets whose condition id is listed or whose
    /// slug contains one of the entries are copied.
    #[serde(default)]
    pub market_allowlist: Vec<String>,

    #[serde(default)]
    pub market_denylist: Vec<String>,

    /// When true, no order leaves the process; results carry a synthetic
    /// DRY_RUN_ id.
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_usd_per_trade: default_max_usd_per_trade(),
            max_usd_per_market: default_max_usd_per_market(),
            max_daily_usd_volume: default_max_daily_usd_volume(),
            do_not_trade_within_seconds_of_resolution: 0,
            market_allowlist: Vec::new(),
            market_denylist: Vec::new(),
            dry_run: true,
        }
    }
}

/// Poll-source cadence (§ polling section of config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// How many recent activity records to request per wallet per poll.
    #[serde(default = "default_trade_limit")]
    pub trade_limit: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            trade_limit: default_trade_limit(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

/// Stop-loss sweep settings (live mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Loss threshold in percent of cost basis (80 = sell at -80 %).
    #[serde(default = "default_stop_loss_percent")]
    pub percent: f64,

    #[serde(default = "default_stop_loss_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            percent: default_stop_loss_percent(),
            check_interval_ms: default_stop_loss_interval_ms(),
        }
    }
}

/// Auto-redeem sweep settings (live mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRedeemConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_auto_redeem_interval_ms")]
    pub interval_ms: u64,
}

impl Default for AutoRedeemConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_auto_redeem_interval_ms(),
        }
    }
}

/// Paper-trading settings (§ paperTrading section of config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperTradingConfig {
    /// SAFETY: paper mode is the default; live submission requires turning
    /// this off explicitly.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    /// Simulated fee applied to notional on both sides (0.001 = 0.1 %).
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            starting_balance: default_starting_balance(),
            fee_rate: default_fee_rate(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level runtime configuration for the Mirror engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub stop_loss: StopLossConfig,

    #[serde(default)]
    pub auto_redeem: AutoRedeemConfig,

    #[serde(default)]
    pub paper_trading: PaperTradingConfig,

    /// Target wallet addresses (lowercased hex). Changes take effect on the
    /// next supervisor restart.
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            polling: PollingConfig::default(),
            stop_loss: StopLossConfig::default(),
            auto_redeem: AutoRedeemConfig::default(),
            paper_trading: PaperTradingConfig::default(),
            targets: Vec::new(),
            chain_id: default_chain_id(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning. Target addresses are lowercased on
    /// load so comparison stays case-insensitive everywhere else.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.normalize_targets();

        info!(
            path = %path.display(),
            targets = config.targets.len(),
            sizing_mode = %config.trading.sizing_mode,
            dry_run = config.risk.dry_run,
            paper = config.paper_trading.enabled,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Lowercase and dedupe target addresses in place.
    pub fn normalize_targets(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.targets = self
            .targets
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
    }

    /// Validate the configuration before the supervisor starts. A failed
    /// start names the exact offending key.
    pub fn validate(&self) -> Result<()> {
        for addr in &self.targets {
            if !is_wallet_address(addr) {
                bail!("targets: '{addr}' is not a 0x-prefixed 40-hex-digit address");
            }
        }
        if !(0.0..1.0).contains(&self.trading.slippage) {
            bail!("trading.slippage: {} must be in [0, 1)", self.trading.slippage);
        }
        if self.trading.fixed_usd_size <= 0.0 {
            bail!(
                "trading.fixedUsdSize: {} must be positive",
                self.trading.fixed_usd_size
            );
        }
        if self.trading.fixed_shares_size <= 0.0 {
            bail!(
                "trading.fixedSharesSize: {} must be positive",
                self.trading.fixed_shares_size
            );
        }
        if self.trading.proportional_multiplier <= 0.0 {
            bail!(
                "trading.proportionalMultiplier: {} must be positive",
                self.trading.proportional_multiplier
            );
        }
        if self.risk.max_usd_per_trade <= 0.0 {
            bail!(
                "risk.maxUsdPerTrade: {} must be positive",
                self.risk.max_usd_per_trade
            );
        }
        if self.paper_trading.starting_balance <= 0.0 {
            bail!(
                "paperTrading.startingBalance: {} must be positive",
                self.paper_trading.starting_balance
            );
        }
        if self.polling.interval_ms == 0 {
            bail!("polling.intervalMs: must be non-zero");
        }
        Ok(())
    }

    /// True when the engine would submit real orders (neither dry-run nor
    /// paper).
    pub fn is_live(&self) -> bool {
        !self.risk.dry_run && !self.paper_trading.enabled
    }
}

/// Loose 0x-address shape check; comparison elsewhere is always lowercase.
pub fn is_wallet_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}
