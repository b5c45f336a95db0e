//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Venue price tick convention: limit prices carry at most five decimals.
pub const PX_DECIMALS: u32 = 5;

/// Round an order size to the venue's per-coin size decimals.
pub fn round_size(value: Decimal, sz_decimals: u32) -> Decimal {
    value.round_dp(sz_decimals)
}

/// Round a limit price to the venue tick convention.
pub fn round_px(value: Decimal) -> Decimal {
    value.round_dp(PX_DECIMALS)
}

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate basis points (1 bp = 0.01%).
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(dec!(10.04999), 2), dec!(10.05));
        assert_eq!(round_size(dec!(9.9502487), 4), dec!(9.9502));
        assert_eq!(round_size(dec!(1.5), 0), dec!(2));
    }

    #[test]
    fn test_round_px() {
        assert_eq!(round_px(dec!(10.0000049)), dec!(10.00000));
        assert_eq!(round_px(dec!(0.1234567)), dec!(0.12346));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(2)), dec!(5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1));
        assert_eq!(to_basis_points(dec!(0.01)), dec!(100));
    }
}
