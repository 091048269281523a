// =============================================================================
// Exit Pricing — side-aware target / stop / trigger arithmetic
// =============================================================================
//
// Every price handed to the broker is rounded to whole cents. Offsets follow
// the entry side:
//
//   - Favourable (profit target, take-profit, trigger): above the reference
//     for a BUY entry, below it for a SELL (short) entry.
//   - Adverse (stop-loss, confirmation stop): the mirror image.
//
// Percent offsets scale the reference price multiplicatively.
// =============================================================================

use crate::types::{Offset, OffsetType, Side};

/// Cushion applied to the limit leg of a stop-limit close so that the order
/// remains marketable once the stop is touched.
pub const SLIPPAGE_CUSHION: f64 = 0.01;

/// Round a price to whole cents.
pub fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Absolute distance represented by `offset` relative to `reference`.
fn distance(reference: f64, offset: Offset) -> f64 {
    match offset.offset_type {
        OffsetType::Dollar => offset.amount,
        OffsetType::Percent => reference * offset.amount / 100.0,
    }
}

/// Price `offset` away from `reference` in the direction that profits the
/// position opened by `entry`.
pub fn favourable_price(reference: f64, offset: Offset, entry: Side) -> f64 {
    let d = distance(reference, offset);
    let raw = match entry {
        Side::Buy => reference + d,
        Side::Sell => reference - d,
    };
    round_cents(raw)
}

/// Price `offset` away from `reference` in the direction that loses money for
/// the position opened by `entry`.
pub fn adverse_price(reference: f64, offset: Offset, entry: Side) -> f64 {
    let d = distance(reference, offset);
    let raw = match entry {
        Side::Buy => reference - d,
        Side::Sell => reference + d,
    };
    round_cents(raw)
}

/// Limit leg of a stop-limit close order. A long is closed by a sell whose
/// limit sits one cushion below the stop; a short is closed by a buy whose
/// limit sits one cushion above.
pub fn stop_limit_price(stop_price: f64, entry: Side) -> f64 {
    let raw = match entry {
        Side::Buy => stop_price - SLIPPAGE_CUSHION,
        Side::Sell => stop_price + SLIPPAGE_CUSHION,
    };
    round_cents(raw)
}

/// Whether `current` has reached `trigger` for a position opened by `entry`.
/// Longs fire at or above the trigger, shorts at or below it.
pub fn trigger_reached(entry: Side, current: f64, trigger: f64) -> bool {
    match entry {
        Side::Buy => current >= trigger,
        Side::Sell => current <= trigger,
    }
}

/// Mid price from a bid/ask pair, falling back to whichever side is present.
pub fn mid_price(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    let valid = |p: Option<f64>| p.filter(|v| *v > 0.0);
    match (valid(bid), valid(ask)) {
        (Some(b), Some(a)) => Some((b + a) / 2.0),
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn dollar_profit_follows_entry_side() {
        assert!(approx(favourable_price(100.0, Offset::dollar(0.5), Side::Buy), 100.50));
        assert!(approx(favourable_price(100.0, Offset::dollar(0.5), Side::Sell), 99.50));
    }

    #[test]
    fn percent_offsets_scale_reference() {
        let tp = favourable_price(100.0, Offset::percent(2.0), Side::Buy);
        let sl = adverse_price(100.0, Offset::percent(1.0), Side::Buy);
        assert!(approx(tp, 102.00));
        assert!(approx(sl, 99.00));
        assert!(approx(stop_limit_price(sl, Side::Buy), 98.99));
    }

    #[test]
    fn short_stop_sits_above_with_cushion_above() {
        let sl = adverse_price(50.0, Offset::dollar(0.25), Side::Sell);
        assert!(approx(sl, 50.25));
        assert!(approx(stop_limit_price(sl, Side::Sell), 50.26));
    }

    #[test]
    fn trigger_direction_long() {
        assert!(!trigger_reached(Side::Buy, 104.99, 105.0));
        assert!(trigger_reached(Side::Buy, 105.00, 105.0));
        assert!(trigger_reached(Side::Buy, 106.00, 105.0));
    }

    #[test]
    fn trigger_direction_short() {
        assert!(!trigger_reached(Side::Sell, 95.01, 95.0));
        assert!(trigger_reached(Side::Sell, 95.00, 95.0));
        assert!(trigger_reached(Side::Sell, 94.10, 95.0));
    }

    #[test]
    fn percent_rounding_lands_on_cents() {
        // 100.1 * 1.005 = 100.6005
        assert!(approx(favourable_price(100.1, Offset::percent(0.5), Side::Buy), 100.60));
    }

    #[test]
    fn mid_price_fallbacks() {
        assert!(mid_price(Some(10.0), Some(10.2)).is_some_and(|p| approx(p, 10.1)));
        assert_eq!(mid_price(Some(10.0), None), Some(10.0));
        assert_eq!(mid_price(Some(0.0), Some(10.2)), Some(10.2));
        assert_eq!(mid_price(None, None), None);
    }
}
