//! Purchasable credit tiers.
//!
//! Credits can only be bought in a fixed set of quantities, each with a fixed
//! USD price. One credit is worth $0.10.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::CreditError;

/// A purchasable quantity of credits and its USD price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tier {
    /// Credits granted on claim.
    pub credits: u64,
    /// Price in US dollars.
    pub usd: Decimal,
}

/// The fixed tier table.
pub const TIERS: [Tier; 4] = [
    Tier {
        credits: 10,
        usd: Decimal::from_parts(1, 0, 0, false, 0),
    },
    Tier {
        credits: 1_000,
        usd: Decimal::from_parts(100, 0, 0, false, 0),
    },
    Tier {
        credits: 10_000,
        usd: Decimal::from_parts(1_000, 0, 0, false, 0),
    },
    Tier {
        credits: 100_000,
        usd: Decimal::from_parts(10_000, 0, 0, false, 0),
    },
];

impl Tier {
    /// Looks up the tier for an exact credit quantity.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] listing the valid tiers when the
    /// quantity is not one of them.
    pub fn for_credits(credits: u64) -> Result<Self, CreditError> {
        TIERS
            .iter()
            .find(|t| t.credits == credits)
            .copied()
            .ok_or_else(|| {
                CreditError::Validation(format!(
                    "invalid credit amount {credits}, valid tiers are: {}",
                    valid_tiers()
                ))
            })
    }
}

fn valid_tiers() -> String {
    TIERS
        .iter()
        .map(|t| t.credits.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_prices_are_ten_cents_per_credit() {
        for tier in TIERS {
            assert_eq!(tier.usd * Decimal::TEN, Decimal::from(tier.credits));
        }
    }

    #[test]
    fn test_for_credits_finds_tier() {
        let tier = Tier::for_credits(1_000).unwrap();
        assert_eq!(tier.usd, Decimal::from(100));
    }

    #[test]
    fn test_unlisted_amount_lists_valid_tiers() {
        let err = Tier::for_credits(500).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, CreditError::Validation(_)));
        assert!(msg.contains("10, 1000, 10000, 100000"), "{msg}");
    }
}
