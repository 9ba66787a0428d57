// =============================================================================
// Normalizer — raw upstream activity → Signal
// =============================================================================
//
// Both activity sources emit the same raw record shape; this is the single
// place heterogeneous upstream data becomes the typed `Signal` the rest of
// the pipeline trades in. Non-copyable activity (rewards, conversions, maker
// rebates) is dropped here.
// =============================================================================

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::polymarket::RawActivity;
use crate::types::{ActivityType, Outcome, Side, Signal};

/// Timestamps at or below this are treated as seconds and scaled to ms.
const SECONDS_CUTOFF: i64 = 1_000_000_000_000;

/// Normalize one raw activity record. Returns `None` for activity types the
/// engine does not copy, or records too malformed to act on.
pub fn normalize(raw: &RawActivity) -> Option<Signal> {
    let activity_type = match raw.activity_type.to_uppercase().as_str() {
        "TRADE" => ActivityType::Trade,
        "SPLIT" => ActivityType::Split,
        "MERGE" => ActivityType::Merge,
        "REDEEM" => ActivityType::Redeem,
        other => {
            debug!(activity_type = other, "dropping non-copyable activity");
            return None;
        }
    };

    // TRADE uses the upstream side; the position-shaping activities imply it.
    let side = match activity_type {
        ActivityType::Trade => match raw.side.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("BUY") => Side::Buy,
            Some(s) if s.eq_ignore_ascii_case("SELL") => Side::Sell,
            _ => {
                debug!("dropping TRADE without a side");
                return None;
            }
        },
        ActivityType::Split => Side::Buy,
        ActivityType::Merge | ActivityType::Redeem => Side::Sell,
    };

    if !(0.0..=1.0).contains(&raw.price) {
        debug!(price = raw.price, "dropping activity with out-of-range price");
        return None;
    }

    let timestamp_ms = canonical_ms(raw.timestamp);
    let wallet = raw.proxy_wallet.to_lowercase();

    let size_shares = (raw.size > 0.0).then_some(raw.size);
    let notional_usd = size_shares.map(|s| raw.price * s);

    Some(Signal {
        trade_id: derive_trade_id(&wallet, timestamp_ms, raw, side),
        target_wallet: wallet,
        timestamp_ms,
        token_id: raw.asset.clone(),
        condition_id: raw.condition_id.clone(),
        market_slug: raw.slug.clone(),
        market_title: raw.title.clone(),
        side,
        price: raw.price,
        size_shares,
        notional_usd,
        outcome: raw.outcome.as_deref().and_then(Outcome::parse),
        activity_type,
    })
}

/// "If ≤ 1e12 treat as seconds."
pub fn canonical_ms(timestamp: i64) -> i64 {
    if timestamp <= SECONDS_CUTOFF {
        timestamp * 1_000
    } else {
        timestamp
    }
}

/// Deterministic trade id. The upstream carries no explicit id, so both
/// sources must derive the same value for the same fill; every input is
/// canonicalized (lowercase wallet, ms timestamp, fixed-precision numbers)
/// before hashing.
fn derive_trade_id(wallet: &str, timestamp_ms: i64, raw: &RawActivity, side: Side) -> String {
    let tx = raw.transaction_hash.as_deref().unwrap_or("");
    let material = format!(
        "{wallet}|{timestamp_ms}|{}|{side}|{:.6}|{:.6}|{tx}",
        raw.asset, raw.price, raw.size
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn raw_trade() -> RawActivity {
        RawActivity {
            proxy_wallet: "0xABCDEF0123456789abcdef0123456789abcdef01".to_string(),
            transaction_hash: Some("0xdeadbeef".to_string()),
            timestamp: 1_700_000_000,
            asset: "11111111111111111111111".to_string(),
            condition_id: Some("0xcond".to_string()),
            slug: Some("will-it-rain".to_string()),
            title: Some("Will it rain?".to_string()),
            side: Some("BUY".to_string()),
            price: 0.42,
            size: 100.0,
            outcome: Some("Yes".to_string()),
            activity_type: "TRADE".to_string(),
        }
    }

    #[test]
    fn trade_normalizes_with_upstream_side() {
        let sig = normalize(&raw_trade()).unwrap();
        assert_eq!(sig.side, Side::Buy);
        assert_eq!(sig.activity_type, ActivityType::Trade);
        assert_eq!(sig.target_wallet, "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(sig.timestamp_ms, 1_700_000_000_000);
        assert_eq!(sig.outcome, Some(Outcome::Yes));
        assert_eq!(sig.size_shares, Some(100.0));
        assert!((sig.notional_usd.unwrap() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn millisecond_timestamps_pass_through() {
        let mut raw = raw_trade();
        raw.timestamp = 1_700_000_000_123;
        let sig = normalize(&raw).unwrap();
        assert_eq!(sig.timestamp_ms, 1_700_000_000_123);
    }

    #[test]
    fn split_merge_redeem_imply_sides() {
        let mut raw = raw_trade();
        raw.side = None;

        raw.activity_type = "SPLIT".to_string();
        assert_eq!(normalize(&raw).unwrap().side, Side::Buy);

        raw.activity_type = "MERGE".to_string();
        assert_eq!(normalize(&raw).unwrap().side, Side::Sell);

        raw.activity_type = "REDEEM".to_string();
        assert_eq!(normalize(&raw).unwrap().side, Side::Sell);
    }

    #[test]
    fn non_copyable_types_are_dropped() {
        let mut raw = raw_trade();
        for t in ["REWARD", "CONVERSION", "MAKER_REBATE", "AIRDROP"] {
            raw.activity_type = t.to_string();
            assert!(normalize(&raw).is_none(), "{t} should be dropped");
        }
    }

    #[test]
    fn trade_without_side_is_dropped() {
        let mut raw = raw_trade();
        raw.side = None;
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn out_of_range_price_is_dropped() {
        let mut raw = raw_trade();
        raw.price = 1.5;
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn trade_id_stable_across_timestamp_units() {
        // The same fill observed via the stream (ms) and the poller (s) must
        // derive the same id or dedup breaks.
        let seconds = raw_trade();
        let mut millis = raw_trade();
        millis.timestamp = 1_700_000_000_000;

        let a = normalize(&seconds).unwrap();
        let b = normalize(&millis).unwrap();
        assert_eq!(a.trade_id, b.trade_id);
    }

    #[test]
    fn trade_id_distinguishes_fills() {
        let a = normalize(&raw_trade()).unwrap();

        let mut other = raw_trade();
        other.price = 0.43;
        let b = normalize(&other).unwrap();
        assert_ne!(a.trade_id, b.trade_id);

        let mut sell = raw_trade();
        sell.side = Some("SELL".to_string());
        let c = normalize(&sell).unwrap();
        assert_ne!(a.trade_id, c.trade_id);
    }

    #[test]
    fn wallet_casing_does_not_change_trade_id() {
        let upper = raw_trade();
        let mut lower = raw_trade();
        lower.proxy_wallet = lower.proxy_wallet.to_lowercase();
        assert_eq!(
            normalize(&upper).unwrap().trade_id,
            normalize(&lower).unwrap().trade_id
        );
    }
}
