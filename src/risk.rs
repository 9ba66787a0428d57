// =============================================================================
// Risk Manager — pre-trade policy gate
// =============================================================================
//
// A pure function of (signal, projected exposure, config): the same inputs
// always yield the same decision. Checks run in a fixed order and the first
// failure wins:
//
//   1. live credentials present when neither dry-run nor paper
//   2. per-trade cap
//   3. per-market cap (BUY only)
//   4. daily volume cap
//   5. allowlist (when non-empty)
//   6. denylist
//   7. resolution proximity
//
// The caller takes a tentative exposure reservation on Allow; the executor
// commits it on success and releases it on failure.
// =============================================================================

use tracing::debug;

use crate::runtime_config::RiskConfig;
use crate::types::{Side, Signal, SkipReason};

/// Everything the decision needs beyond the signal and config.
#[derive(Debug, Clone)]
pub struct RiskContext {
    /// Notional of the order being considered.
    pub projected_usd: f64,
    /// Committed + reserved exposure for this market.
    pub per_market_usd: f64,
    /// Committed + reserved volume for the current date.
    pub daily_volume_usd: f64,
    /// Resolution timestamp of the market, when known.
    pub resolution_ts_ms: Option<i64>,
    /// Live CLOB credentials are configured.
    pub has_credentials: bool,
    /// Paper mode is on (credentials not required).
    pub paper_mode: bool,
    pub now_ms: i64,
}

/// The gate's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Skip(SkipReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Evaluate the policy chain for one signal.
pub fn evaluate(signal: &Signal, ctx: &RiskContext, cfg: &RiskConfig) -> Decision {
    // 1. A non-dry-run, non-paper run must be able to sign orders.
    if !cfg.dry_run && !ctx.paper_mode && !ctx.has_credentials {
        return skip(signal, SkipReason::MissingCreds);
    }

    // 2. Per-trade cap.
    if ctx.projected_usd > cfg.max_usd_per_trade {
        return skip(signal, SkipReason::CapPerTrade);
    }

    // 3. Per-market cap. Only BUYs add exposure.
    if signal.side == Side::Buy
        && ctx.per_market_usd + ctx.projected_usd > cfg.max_usd_per_market
    {
        return skip(signal, SkipReason::CapPerMarket);
    }

    // 4. Daily volume cap.
    if ctx.daily_volume_usd + ctx.projected_usd > cfg.max_daily_usd_volume {
        return skip(signal, SkipReason::CapDailyVolume);
    }

    // 5. Allowlist: condition id listed, or slug contains an entry.
    if !cfg.market_allowlist.is_empty() && !matches_list(signal, &cfg.market_allowlist) {
        return skip(signal, SkipReason::NotInAllowlist);
    }

    // 6. Denylist.
    if matches_list(signal, &cfg.market_denylist) {
        return skip(signal, SkipReason::Denylisted);
    }

    // 7. Resolution proximity.
    if cfg.do_not_trade_within_seconds_of_resolution > 0 {
        if let Some(resolution_ts) = ctx.resolution_ts_ms {
            let threshold_ms = cfg.do_not_trade_within_seconds_of_resolution as i64 * 1_000;
            if resolution_ts - ctx.now_ms <= threshold_ms {
                return skip(signal, SkipReason::TooCloseToResolution);
            }
        }
    }

    Decision::Allow
}

/// True when the signal's condition id is listed exactly, or its slug
/// contains any entry as a substring (case-insensitive).
fn matches_list(signal: &Signal, list: &[String]) -> bool {
    if list.is_empty() {
        return false;
    }

    let condition = signal
        .condition_id
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();
    let slug = signal
        .market_slug
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    list.iter().any(|entry| {
        let entry = entry.to_lowercase();
        (!condition.is_empty() && condition == entry)
            || (!slug.is_empty() && slug.contains(&entry))
    })
}

fn skip(signal: &Signal, reason: SkipReason) -> Decision {
    debug!(
        trade_id = %signal.trade_id,
        reason = %reason,
        "risk gate skipped trade"
    );
    Decision::Skip(reason)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityType, Outcome};

    fn signal() -> Signal {
        Signal {
            target_wallet: "0xabc".to_string(),
            trade_id: "t1".to_string(),
            timestamp_ms: 1_700_000_000_000,
            token_id: "tok".to_string(),
            condition_id: Some("0xcond".to_string()),
            market_slug: Some("will-it-rain-in-london".to_string()),
            market_title: None,
            side: Side::Buy,
            price: 0.5,
            size_shares: Some(10.0),
            notional_usd: Some(5.0),
            outcome: Some(Outcome::Yes),
            activity_type: ActivityType::Trade,
        }
    }

    fn ctx(projected_usd: f64) -> RiskContext {
        RiskContext {
            projected_usd,
            per_market_usd: 0.0,
            daily_volume_usd: 0.0,
            resolution_ts_ms: None,
            has_credentials: true,
            paper_mode: false,
            now_ms: 1_700_000_000_000,
        }
    }

    fn config() -> RiskConfig {
        RiskConfig {
            max_usd_per_trade: 5.0,
            max_usd_per_market: 20.0,
            max_daily_usd_volume: 50.0,
            do_not_trade_within_seconds_of_resolution: 0,
            market_allowlist: Vec::new(),
            market_denylist: Vec::new(),
            dry_run: false,
        }
    }

    #[test]
    fn clean_trade_is_allowed() {
        assert_eq!(evaluate(&signal(), &ctx(5.0), &config()), Decision::Allow);
    }

    #[test]
    fn missing_creds_blocks_live_run() {
        let mut c = ctx(1.0);
        c.has_credentials = false;
        assert_eq!(
            evaluate(&signal(), &c, &config()),
            Decision::Skip(SkipReason::MissingCreds)
        );

        // Paper and dry-run both lift the requirement.
        c.paper_mode = true;
        assert_eq!(evaluate(&signal(), &c, &config()), Decision::Allow);

        c.paper_mode = false;
        let mut cfg = config();
        cfg.dry_run = true;
        assert_eq!(evaluate(&signal(), &c, &cfg), Decision::Allow);
    }

    #[test]
    fn per_trade_cap_wins_first() {
        // 7.50 projected vs 5.00 cap: skipped, and the reason is the
        // per-trade cap even though the daily cap would also fail later.
        let mut c = ctx(7.5);
        c.daily_volume_usd = 49.0;
        assert_eq!(
            evaluate(&signal(), &c, &config()),
            Decision::Skip(SkipReason::CapPerTrade)
        );
    }

    #[test]
    fn per_market_cap_applies_to_buys_only() {
        let mut c = ctx(5.0);
        c.per_market_usd = 18.0;
        assert_eq!(
            evaluate(&signal(), &c, &config()),
            Decision::Skip(SkipReason::CapPerMarket)
        );

        let mut sell = signal();
        sell.side = Side::Sell;
        assert_eq!(evaluate(&sell, &c, &config()), Decision::Allow);
    }

    #[test]
    fn daily_volume_cap() {
        let mut c = ctx(5.0);
        c.daily_volume_usd = 46.0;
        assert_eq!(
            evaluate(&signal(), &c, &config()),
            Decision::Skip(SkipReason::CapDailyVolume)
        );
    }

    #[test]
    fn allowlist_matches_condition_or_slug_substring() {
        let mut cfg = config();
        cfg.market_allowlist = vec!["rain".to_string()];
        assert_eq!(evaluate(&signal(), &ctx(1.0), &cfg), Decision::Allow);

        cfg.market_allowlist = vec!["0xCOND".to_string()];
        assert_eq!(evaluate(&signal(), &ctx(1.0), &cfg), Decision::Allow);

        cfg.market_allowlist = vec!["something-else".to_string()];
        assert_eq!(
            evaluate(&signal(), &ctx(1.0), &cfg),
            Decision::Skip(SkipReason::NotInAllowlist)
        );
    }

    #[test]
    fn denylist_blocks_slug_substring() {
        let mut cfg = config();
        cfg.market_denylist = vec!["london".to_string()];
        assert_eq!(
            evaluate(&signal(), &ctx(1.0), &cfg),
            Decision::Skip(SkipReason::Denylisted)
        );
    }

    #[test]
    fn resolution_proximity_blocks_near_expiry() {
        let mut cfg = config();
        cfg.do_not_trade_within_seconds_of_resolution = 3_600;

        let mut c = ctx(1.0);
        // Resolves in 30 minutes: inside the window.
        c.resolution_ts_ms = Some(c.now_ms + 30 * 60 * 1_000);
        assert_eq!(
            evaluate(&signal(), &c, &cfg),
            Decision::Skip(SkipReason::TooCloseToResolution)
        );

        // Resolves in two hours: fine.
        c.resolution_ts_ms = Some(c.now_ms + 2 * 3_600 * 1_000);
        assert_eq!(evaluate(&signal(), &c, &cfg), Decision::Allow);

        // Unknown resolution time: the check cannot apply.
        c.resolution_ts_ms = None;
        assert_eq!(evaluate(&signal(), &c, &cfg), Decision::Allow);
    }

    #[test]
    fn decision_is_deterministic() {
        let s = signal();
        let c = ctx(5.0);
        let cfg = config();
        let first = evaluate(&s, &c, &cfg);
        for _ in 0..10 {
            assert_eq!(evaluate(&s, &c, &cfg), first);
        }
    }
}
