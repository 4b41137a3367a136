//! Amount conversions and the payment tolerance rule.
//!
//! All payment comparisons happen in a chain's smallest indivisible unit
//! (satoshis, or 10^-6 USDC). USD and native decimal amounts are derived
//! quantities only.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::CreditError;

/// Percentage of the required amount that counts as paid.
///
/// Absorbs quote-to-settlement price drift and provider rounding.
pub const TOLERANCE_PERCENT: u128 = 95;

/// Credits per US dollar for escrow conversions (1 credit = $0.10).
pub const CREDITS_PER_USD: Decimal = Decimal::TEN;

/// Returns `true` when `received` is at least 95% of `required`.
///
/// Integer arithmetic in `u128`, so the boundary is exact: 95% passes and
/// anything below fails.
#[must_use]
pub fn meets_tolerance(received: u64, required: u64) -> bool {
    u128::from(received) * 100 >= u128::from(required) * TOLERANCE_PERCENT
}

/// Converts a decimal amount to smallest units, rounding up.
///
/// Rounding up keeps a quote from ever asking for less than the price.
///
/// # Errors
///
/// Returns [`CreditError::Validation`] for negative amounts or amounts that do
/// not fit in `u64` smallest units.
pub fn to_smallest_units(amount: Decimal, decimals: u32) -> Result<u64, CreditError> {
    if amount.is_sign_negative() {
        return Err(CreditError::Validation(format!(
            "amount must not be negative, got {amount}"
        )));
    }
    let scale = Decimal::from(10u64.pow(decimals));
    amount
        .checked_mul(scale)
        .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::AwayFromZero))
        .and_then(|v| v.to_u64())
        .ok_or_else(|| CreditError::Validation(format!("amount {amount} is out of range")))
}

/// Converts smallest units back to a decimal amount with `decimals` places.
#[must_use]
pub fn from_smallest_units(units: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(units), decimals)
}

/// Converts a USD amount to credits, rounding up: `ceil(usd * 10)`.
///
/// # Errors
///
/// Returns [`CreditError::Validation`] if the amount is not positive or does
/// not fit in `u64` credits.
pub fn credits_for_usd(amount_usd: Decimal) -> Result<u64, CreditError> {
    if amount_usd <= Decimal::ZERO {
        return Err(CreditError::Validation(format!(
            "amount_usd must be positive, got {amount_usd}"
        )));
    }
    amount_usd
        .checked_mul(CREDITS_PER_USD)
        .map(|v| v.ceil())
        .and_then(|v| v.to_u64())
        .ok_or_else(|| CreditError::Validation(format!("amount_usd {amount_usd} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tolerance_boundary() {
        // $100.00 in USDC minor units
        let required = 100_000_000;
        assert!(meets_tolerance(95_000_000, required));
        assert!(!meets_tolerance(94_900_000, required));
        assert!(!meets_tolerance(94_999_999, required));
        assert!(meets_tolerance(required, required));
    }

    #[test]
    fn test_tolerance_does_not_overflow() {
        assert!(meets_tolerance(u64::MAX, u64::MAX));
        assert!(!meets_tolerance(0, u64::MAX));
    }

    #[test]
    fn test_to_smallest_units_rounds_up() {
        let btc = Decimal::from_str("0.000000011").unwrap();
        assert_eq!(to_smallest_units(btc, 8).unwrap(), 2);
        let usdc = Decimal::from(100);
        assert_eq!(to_smallest_units(usdc, 6).unwrap(), 100_000_000);
    }

    #[test]
    fn test_from_smallest_units() {
        assert_eq!(
            from_smallest_units(150_000, 8),
            Decimal::from_str("0.00150000").unwrap()
        );
    }

    #[test]
    fn test_credits_for_usd_rounds_up() {
        assert_eq!(credits_for_usd(Decimal::from(5)).unwrap(), 50);
        assert_eq!(credits_for_usd(Decimal::from_str("0.01").unwrap()).unwrap(), 1);
        assert_eq!(credits_for_usd(Decimal::from_str("2.34").unwrap()).unwrap(), 24);
        assert!(credits_for_usd(Decimal::ZERO).is_err());
        assert!(credits_for_usd(Decimal::from(-1)).is_err());
    }
}
