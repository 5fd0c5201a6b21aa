//! Decimal arithmetic utilities for position sizing and deviation checks.

use rust_decimal::Decimal;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Subtraction clamped to zero.
///
/// Several sizing formulas intentionally clamp to zero instead of failing
/// when the subtrahend exceeds the minuend (e.g. idle capital already
/// consumed by withdrawal demand).
pub fn saturating_sub(a: Decimal, b: Decimal) -> Decimal {
    if b >= a {
        Decimal::ZERO
    } else {
        a - b
    }
}

/// Relative deviation of an executed amount from a requested amount.
///
/// Returns `(executed - requested) / requested`, zero when nothing was
/// requested. Negative values mean a shortfall.
pub fn relative_deviation(requested: Decimal, executed: Decimal) -> Decimal {
    safe_div(executed - requested, requested)
}

/// Whether `executed` deviates from `requested` by more than `threshold`.
pub fn exceeds_deviation(requested: Decimal, executed: Decimal, threshold: Decimal) -> bool {
    relative_deviation(requested, executed).abs() > threshold
}

/// Proportional share: `total * part / whole`, zero when `whole` is zero.
///
/// Used for pro-rata collateral sizing on partial position decreases.
pub fn proportional(total: Decimal, part: Decimal, whole: Decimal) -> Decimal {
    safe_div(total * part, whole)
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_saturating_sub_clamps_to_zero() {
        assert_eq!(saturating_sub(dec!(5), dec!(3)), dec!(2));
        assert_eq!(saturating_sub(dec!(3), dec!(5)), Decimal::ZERO);
        assert_eq!(saturating_sub(dec!(3), dec!(3)), Decimal::ZERO);
    }

    #[test]
    fn test_relative_deviation() {
        // 95 executed against 100 requested is a -5% shortfall
        assert_eq!(relative_deviation(dec!(100), dec!(95)), dec!(-0.05));
        assert_eq!(relative_deviation(dec!(100), dec!(100)), Decimal::ZERO);
        assert_eq!(relative_deviation(Decimal::ZERO, dec!(5)), Decimal::ZERO);
    }

    #[test]
    fn test_exceeds_deviation() {
        assert!(exceeds_deviation(dec!(100), dec!(95), dec!(0.01)));
        assert!(!exceeds_deviation(dec!(100), dec!(99.5), dec!(0.01)));
        // Overfills count too
        assert!(exceeds_deviation(dec!(100), dec!(105), dec!(0.01)));
    }

    #[test]
    fn test_proportional() {
        // 1000 net balance, selling 3 of 12 tokens frees 250
        assert_eq!(proportional(dec!(1000), dec!(3), dec!(12)), dec!(250));
        assert_eq!(proportional(dec!(1000), dec!(3), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(round_down_to_lot(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }
}
