// =============================================================================
// Sizing Engine — signal + config → concrete order size and limit price
// =============================================================================
//
// Three modes:
//   fixed_usd     — constant notional, shares derived from price
//   fixed_shares  — constant shares, notional derived from price
//   proportional  — copy a fraction of the target's size; falls back to the
//                   target's notional, then to fixed_usd, when fields are
//                   missing
//
// Shares round to two decimals with a 0.01 floor; the notional is recomputed
// from the rounded shares. The limit price gets a slippage cushion toward
// the aggressive side, clamped to [0.01, 0.99] and quantized to two
// decimals, so the order is marketable against the observed fill.
// =============================================================================

use crate::runtime_config::{SizingMode, TradingConfig};
use crate::types::{OrderRequest, Side, Signal};

/// Shares and notional produced by the sizing step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedOrder {
    pub shares: f64,
    pub usd: f64,
}

/// Price bounds after slippage adjustment.
const PRICE_MIN: f64 = 0.01;
const PRICE_MAX: f64 = 0.99;

/// Smallest share size an order can carry.
const SHARES_FLOOR: f64 = 0.01;

/// Translate a signal into shares + notional under the configured mode.
/// Returns `None` only when the signal price is unusable.
pub fn size_signal(signal: &Signal, cfg: &TradingConfig) -> Option<SizedOrder> {
    if signal.price <= 0.0 {
        return None;
    }

    let shares = match cfg.sizing_mode {
        SizingMode::FixedUsd => cfg.fixed_usd_size / signal.price,
        SizingMode::FixedShares => cfg.fixed_shares_size,
        SizingMode::Proportional => {
            if let Some(target_shares) = signal.size_shares {
                target_shares * cfg.proportional_multiplier
            } else if let Some(notional) = signal.notional_usd {
                (notional * cfg.proportional_multiplier) / signal.price
            } else {
                cfg.fixed_usd_size / signal.price
            }
        }
    };

    let shares = quantize(shares).max(SHARES_FLOOR);
    let usd = quantize(shares * signal.price);

    Some(SizedOrder { shares, usd })
}

/// Build the full order request: sized shares plus the slippage-adjusted
/// marketable limit price.
pub fn build_order(signal: &Signal, token_id: &str, cfg: &TradingConfig) -> Option<OrderRequest> {
    let sized = size_signal(signal, cfg)?;
    let price = slip_price(signal.price, signal.side, cfg.slippage);

    Some(OrderRequest {
        token_id: token_id.to_string(),
        side: signal.side,
        price,
        size_shares: sized.shares,
        usd: quantize(price * sized.shares),
        time_in_force: "GTC".to_string(),
    })
}

/// Cushion the observed price toward the aggressive side and quantize.
pub fn slip_price(price: f64, side: Side, slippage: f64) -> f64 {
    let adjusted = match side {
        Side::Buy => (price * (1.0 + slippage)).min(PRICE_MAX),
        Side::Sell => (price * (1.0 - slippage)).max(PRICE_MIN),
    };
    quantize(adjusted).clamp(PRICE_MIN, PRICE_MAX)
}

/// Round to two decimals.
pub fn quantize(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityType, Outcome};

    fn signal(price: f64, size_shares: Option<f64>, notional: Option<f64>) -> Signal {
        Signal {
            target_wallet: "0xabc".to_string(),
            trade_id: "t1".to_string(),
            timestamp_ms: 0,
            token_id: "tok".to_string(),
            condition_id: None,
            market_slug: None,
            market_title: None,
            side: Side::Buy,
            price,
            size_shares,
            notional_usd: notional,
            outcome: Some(Outcome::Yes),
            activity_type: ActivityType::Trade,
        }
    }

    fn cfg(mode: SizingMode) -> TradingConfig {
        TradingConfig {
            sizing_mode: mode,
            fixed_usd_size: 10.0,
            fixed_shares_size: 5.0,
            proportional_multiplier: 0.01,
            slippage: 0.01,
            min_order_size: 0.5,
            min_order_shares: 0.1,
        }
    }

    #[test]
    fn fixed_usd_derives_shares() {
        let sized = size_signal(&signal(0.5, None, None), &cfg(SizingMode::FixedUsd)).unwrap();
        assert_eq!(sized.shares, 20.0);
        assert_eq!(sized.usd, 10.0);
    }

    #[test]
    fn fixed_shares_derives_usd() {
        let sized = size_signal(&signal(0.4, None, None), &cfg(SizingMode::FixedShares)).unwrap();
        assert_eq!(sized.shares, 5.0);
        assert_eq!(sized.usd, 2.0);
    }

    #[test]
    fn proportional_copies_share_fraction() {
        // Multiplier 0.01 against a 200-share target fill → 2.00 shares.
        let sized =
            size_signal(&signal(0.5, Some(200.0), None), &cfg(SizingMode::Proportional)).unwrap();
        assert_eq!(sized.shares, 2.0);
        assert_eq!(sized.usd, 1.0);
    }

    #[test]
    fn proportional_falls_back_to_notional_then_fixed() {
        // No shares: scale the target's notional.
        let sized =
            size_signal(&signal(0.5, None, Some(300.0)), &cfg(SizingMode::Proportional)).unwrap();
        assert_eq!(sized.shares, 6.0); // 300 * 0.01 / 0.5

        // Neither: fixed_usd as last resort.
        let sized =
            size_signal(&signal(0.5, None, None), &cfg(SizingMode::Proportional)).unwrap();
        assert_eq!(sized.shares, 20.0);
    }

    #[test]
    fn shares_floor_applies() {
        let mut c = cfg(SizingMode::Proportional);
        c.proportional_multiplier = 0.00001;
        let sized = size_signal(&signal(0.5, Some(10.0), None), &c).unwrap();
        assert_eq!(sized.shares, 0.01);
    }

    #[test]
    fn unusable_price_returns_none() {
        assert!(size_signal(&signal(0.0, Some(10.0), None), &cfg(SizingMode::FixedUsd)).is_none());
    }

    #[test]
    fn buy_slippage_pushes_up_and_quantizes() {
        // 0.5 with 1 % slippage → 0.505 → 0.51 after quantization.
        assert_eq!(slip_price(0.5, Side::Buy, 0.01), 0.51);
    }

    #[test]
    fn sell_slippage_pushes_down() {
        assert_eq!(slip_price(0.5, Side::Sell, 0.01), 0.5); // 0.495 rounds to 0.50
        assert_eq!(slip_price(0.5, Side::Sell, 0.05), 0.48); // 0.475 rounds
    }

    #[test]
    fn slipped_price_stays_inside_book_bounds() {
        assert_eq!(slip_price(0.985, Side::Buy, 0.05), 0.99);
        assert_eq!(slip_price(0.015, Side::Sell, 0.5), 0.01);
    }

    #[test]
    fn price_round_trip_bounded_by_slippage_plus_quantization() {
        // |price' - price| <= s*price + 0.005 across the whole price range.
        let s = 0.02;
        for side in [Side::Buy, Side::Sell] {
            let mut p = 0.01;
            while p <= 0.99 {
                let adjusted = slip_price(p, side, s);
                assert!((0.01..=0.99).contains(&adjusted));
                assert!(
                    (adjusted - p).abs() <= s * p + 0.005 + 1e-9,
                    "price {p} side {side} adjusted {adjusted}"
                );
                p += 0.07;
            }
        }
    }

    #[test]
    fn build_order_recomputes_usd_from_rounded_values() {
        let order = build_order(
            &signal(0.5, Some(200.0), None),
            "tok-resolved",
            &cfg(SizingMode::Proportional),
        )
        .unwrap();
        assert_eq!(order.token_id, "tok-resolved");
        assert_eq!(order.size_shares, 2.0);
        assert_eq!(order.price, 0.51);
        assert!((order.usd - 1.02).abs() < 1e-9);
        assert_eq!(order.time_in_force, "GTC");
    }
}
