// =============================================================================
// Shared types used across the Mirror copy-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order / fill direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Binary market outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "Yes", alias = "YES", alias = "yes")]
    Yes,
    #[serde(rename = "No", alias = "NO", alias = "no")]
    No,
}

impl Outcome {
    /// Parse an upstream outcome string, tolerating any casing.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "Yes"),
            Self::No => write!(f, "No"),
        }
    }
}

/// Copyable activity categories. Anything else upstream (rewards, conversions,
/// maker rebates) is dropped by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    #[serde(rename = "TRADE")]
    Trade,
    #[serde(rename = "SPLIT")]
    Split,
    #[serde(rename = "MERGE")]
    Merge,
    #[serde(rename = "REDEEM")]
    Redeem,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trade => write!(f, "TRADE"),
            Self::Split => write!(f, "SPLIT"),
            Self::Merge => write!(f, "MERGE"),
            Self::Redeem => write!(f, "REDEEM"),
        }
    }
}

/// A normalized observation of one target-wallet activity. This is the only
/// shape the pipeline trades in downstream of the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Lowercased hex address of the wallet that produced this activity.
    pub target_wallet: String,
    /// Stable id used for deduplication across the stream and poll sources.
    pub trade_id: String,
    pub timestamp_ms: i64,
    /// CLOB token id of the traded outcome. May be empty until resolved.
    pub token_id: String,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub market_title: Option<String>,
    pub side: Side,
    /// Observed fill price in [0, 1].
    pub price: f64,
    #[serde(default)]
    pub size_shares: Option<f64>,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    pub activity_type: ActivityType,
}

/// A concrete order the executor will attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    /// Slippage-adjusted limit price, quantized to two decimals, in
    /// [0.01, 0.99].
    pub price: f64,
    /// Shares, rounded to two decimals.
    pub size_shares: f64,
    /// Recomputed notional (`price * size_shares` after rounding).
    pub usd: f64,
    pub time_in_force: String,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub executed_price: Option<f64>,
    #[serde(default)]
    pub executed_size: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set when the order was never submitted because a policy said no.
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
}

impl OrderResult {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Every reason the pipeline can decline to copy a trade. Skips are recorded
/// and surfaced to the UI; they are never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCreds,
    CapPerTrade,
    CapPerMarket,
    CapDailyVolume,
    NotInAllowlist,
    Denylisted,
    TooCloseToResolution,
    UnresolvedToken,
    BelowMinimum,
    TemporarilyPaused,
    InsufficientBalance,
    InsufficientHoldings,
    UnsupportedActivity,
}

impl SkipReason {
    /// Short machine-readable reason string used in events and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCreds => "missing_creds",
            Self::CapPerTrade => "cap_per_trade",
            Self::CapPerMarket => "cap_per_market",
            Self::CapDailyVolume => "cap_daily_volume",
            Self::NotInAllowlist => "not_in_allowlist",
            Self::Denylisted => "denylisted",
            Self::TooCloseToResolution => "too_close_to_resolution",
            Self::UnresolvedToken => "unresolved_token",
            Self::BelowMinimum => "below_minimum",
            Self::TemporarilyPaused => "temporarily_paused",
            Self::InsufficientBalance => "insufficient_balance",
            Self::InsufficientHoldings => "insufficient_holdings",
            Self::UnsupportedActivity => "unsupported_activity",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor run state, including which activity source is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Starting,
    Streaming,
    Polling,
    /// Stream reconnect attempts exhausted; only the poller runs until a
    /// manual restart.
    Degraded,
    Stopping,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Streaming | Self::Polling | Self::Degraded)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Polling => write!(f, "polling"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// One row of the UI trade log: a detected target fill and what we did with
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: String,
    pub timestamp_ms: i64,
    pub target_wallet: String,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub market_title: Option<String>,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub shares: f64,
    pub usd: f64,
    /// "copied", "skipped", or "failed".
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// A held position in one outcome token. Used both for live holdings and the
/// paper book.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub token_id: String,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub market_title: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    /// Signed: negative means a paper short.
    pub shares: f64,
    pub avg_entry_price: f64,
    pub total_cost: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub opened_at: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub redeemable: bool,
    #[serde(default)]
    pub settled: bool,
    #[serde(default)]
    pub settlement_price: Option<f64>,
    #[serde(default)]
    pub settlement_pnl: Option<f64>,
}

impl Position {
    /// Open a fresh position from a first fill.
    pub fn open(token_id: &str, shares: f64, price: f64) -> Self {
        Self {
            token_id: token_id.to_string(),
            condition_id: None,
            market_slug: None,
            market_title: None,
            outcome: None,
            shares,
            avg_entry_price: price,
            total_cost: shares * price,
            current_price: price,
            unrealized_pnl: 0.0,
            opened_at: chrono::Utc::now().to_rfc3339(),
            resolved: false,
            redeemable: false,
            settled: false,
            settlement_price: None,
            settlement_pnl: None,
        }
    }

    /// Average a BUY fill into the position.
    pub fn apply_buy(&mut self, shares: f64, price: f64) {
        let new_shares = self.shares + shares;
        self.total_cost += shares * price;
        self.shares = new_shares;
        if new_shares > 0.0 {
            self.avg_entry_price = self.total_cost / new_shares;
        }
    }

    /// Reduce the position by a SELL fill; returns the gross realized PnL
    /// (before fees).
    pub fn apply_sell(&mut self, shares: f64, price: f64) -> f64 {
        let pnl = shares * (price - self.avg_entry_price);
        self.shares -= shares;
        self.total_cost = self.shares * self.avg_entry_price;
        pnl
    }

    /// Refresh mark-to-market fields from a fresh price.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.shares * (price - self.avg_entry_price);
    }

    pub fn is_open(&self) -> bool {
        !self.settled && self.shares.abs() > f64::EPSILON
    }

    pub fn cost_basis(&self) -> f64 {
        self.total_cost
    }
}

/// Current UNIX time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_serializes_to_upstream_strings() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
        let s: Side = serde_json::from_str("\"buy\"").unwrap();
        assert_eq!(s, Side::Buy);
    }

    #[test]
    fn outcome_parse_tolerates_casing() {
        assert_eq!(Outcome::parse("YES"), Some(Outcome::Yes));
        assert_eq!(Outcome::parse("no"), Some(Outcome::No));
        assert_eq!(Outcome::parse(" Yes "), Some(Outcome::Yes));
        assert_eq!(Outcome::parse("maybe"), None);
    }

    #[test]
    fn skip_reason_strings_are_snake_case() {
        assert_eq!(SkipReason::CapPerTrade.as_str(), "cap_per_trade");
        assert_eq!(SkipReason::UnresolvedToken.as_str(), "unresolved_token");
        let json = serde_json::to_string(&SkipReason::TemporarilyPaused).unwrap();
        assert_eq!(json, "\"temporarily_paused\"");
    }

    #[test]
    fn run_state_running_variants() {
        assert!(RunState::Streaming.is_running());
        assert!(RunState::Polling.is_running());
        assert!(RunState::Degraded.is_running());
        assert!(!RunState::Stopped.is_running());
        assert!(!RunState::Stopping.is_running());
    }
}
