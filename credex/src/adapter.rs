//! The chain adapter contract and its registry.
//!
//! Adapters only report what a provider observed: amounts received and how
//! deep each funding transfer sits. Whether that counts as paid or confirmed is
//! decided here, by [`ConfirmationRule::evaluate`], so every chain applies the
//! same tolerance.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::amount::{from_smallest_units, meets_tolerance, to_smallest_units};
use crate::chain::{Chain, ChainId};
use crate::error::{ChainError, CreditError};
use crate::tier::Tier;

/// Static characteristics of a chain, used for quotes and confirmation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainProfile {
    /// Confirmations the chain needs before funds count.
    pub required_confirmations: u64,
    /// Rough time until confirmation, in seconds.
    pub est_confirmation_secs: u64,
    /// Rough network fee the payer pays, in USD.
    pub est_fee_usd: Decimal,
    /// Decimals of the payment asset.
    pub decimals: u32,
}

/// How a chain's observation turns into "confirmed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", content = "depth", rename_all = "snake_case")]
pub enum ConfirmationRule {
    /// Confirmed once the amount already settled on chain meets tolerance.
    ConfirmedBalance,
    /// Confirmed once paid and every qualifying transfer is at least this deep.
    MinimumDepth(u64),
}

/// One transfer into a deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedTransfer {
    /// Transaction hash or signature.
    pub txid: String,
    /// Amount received in smallest units, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    /// Confirmations (or slots) on top of the transfer, 0 while unconfirmed.
    pub confirmations: u64,
}

/// Raw provider view of a deposit address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainObservation {
    /// Everything received, including unconfirmed funds.
    pub total_received: u64,
    /// Funds the chain already considers settled.
    pub confirmed_received: u64,
    /// Transfers that paid the address.
    pub transfers: Vec<ObservedTransfer>,
}

impl ChainObservation {
    /// Minimum confirmation count across transfers, 0 when there are none.
    #[must_use]
    pub fn confirmations(&self) -> u64 {
        self.transfers
            .iter()
            .map(|t| t.confirmations)
            .min()
            .unwrap_or(0)
    }
}

/// Verification result for a deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentStatus {
    /// Everything received, in smallest units.
    pub total_received: u64,
    /// Settled funds, in smallest units.
    pub confirmed_received: u64,
    /// Minimum confirmations across funding transfers.
    pub confirmations: u64,
    /// `total_received` meets tolerance.
    pub is_paid: bool,
    /// The chain's confirmation rule is satisfied.
    pub is_confirmed: bool,
    /// Transfers that paid the address.
    pub transactions: Vec<ObservedTransfer>,
}

impl ConfirmationRule {
    /// Applies the tolerance and this rule to an observation.
    #[must_use]
    pub fn evaluate(&self, observation: ChainObservation, required: u64) -> PaymentStatus {
        let confirmations = observation.confirmations();
        let is_paid = meets_tolerance(observation.total_received, required);
        let is_confirmed = match *self {
            Self::ConfirmedBalance => meets_tolerance(observation.confirmed_received, required),
            Self::MinimumDepth(depth) => {
                is_paid && !observation.transfers.is_empty() && confirmations >= depth
            }
        };
        PaymentStatus {
            total_received: observation.total_received,
            confirmed_received: observation.confirmed_received,
            confirmations,
            is_paid,
            is_confirmed,
            transactions: observation.transfers,
        }
    }
}

/// A USD price expressed in a chain's payment asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeAmount {
    /// Human-readable amount (BTC, USDC).
    pub native: Decimal,
    /// The same amount in smallest units, rounded up.
    pub smallest: u64,
}

impl NativeAmount {
    /// Prices a dollar-pegged asset: one unit per USD.
    ///
    /// # Errors
    ///
    /// [`ChainError::Malformed`] if the amount does not fit in smallest units.
    pub fn pegged(chain: Chain, usd: Decimal, decimals: u32) -> Result<Self, ChainError> {
        let smallest =
            to_smallest_units(usd, decimals).map_err(|e| ChainError::malformed(chain.as_str(), e))?;
        Ok(Self {
            native: from_smallest_units(smallest, decimals),
            smallest,
        })
    }

    /// Prices a floating asset from its USD spot price, rounding up.
    ///
    /// # Errors
    ///
    /// [`ChainError::Malformed`] for a non-positive price or an amount that
    /// does not fit in smallest units.
    pub fn at_spot(
        chain: Chain,
        usd: Decimal,
        usd_per_unit: Decimal,
        decimals: u32,
    ) -> Result<Self, ChainError> {
        if usd_per_unit <= Decimal::ZERO {
            return Err(ChainError::malformed(
                chain.as_str(),
                format!("non-positive spot price {usd_per_unit}"),
            ));
        }
        let native = usd
            .checked_div(usd_per_unit)
            .ok_or_else(|| ChainError::malformed(chain.as_str(), "price conversion overflow"))?;
        let scaled = native
            .checked_mul(Decimal::from(10u64.pow(decimals)))
            .map(|v| v.ceil())
            .ok_or_else(|| ChainError::malformed(chain.as_str(), "price conversion overflow"))?;
        let smallest =
            to_smallest_units(scaled, 0).map_err(|e| ChainError::malformed(chain.as_str(), e))?;
        Ok(Self {
            native: from_smallest_units(smallest, decimals),
            smallest,
        })
    }
}

/// Where a payer should send funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositTarget {
    /// Payment token the address was derived from.
    pub payment_token: String,
    /// Derived deposit address.
    pub deposit_address: String,
}

/// Everything a payer needs to complete a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    /// Chain to pay on.
    pub chain: Chain,
    /// CAIP-2 identifier of the chain.
    pub network: ChainId,
    /// Credits granted on claim.
    pub credits: u64,
    /// Tier price in USD.
    pub usd_amount: Decimal,
    /// Amount due in the payment asset.
    pub native_amount: Decimal,
    /// Amount due in smallest units.
    pub smallest_unit_amount: u64,
    /// Address to pay.
    pub deposit_address: String,
    /// Token used to poll and claim.
    pub payment_token: String,
    /// Confirmations needed before credits can be claimed.
    pub required_confirmations: u64,
    /// Rough time until confirmation, in seconds.
    pub est_confirmation_secs: u64,
    /// Rough network fee, in USD.
    pub est_fee_usd: Decimal,
}

/// Chain-specific pricing and read-only payment verification.
#[async_trait::async_trait]
pub trait ChainAdapter: Send + Sync + Debug {
    /// The chain this adapter serves.
    fn chain(&self) -> Chain;

    /// Static characteristics of the chain.
    fn profile(&self) -> ChainProfile;

    /// How observations are judged confirmed.
    fn rule(&self) -> ConfirmationRule;

    /// Converts a USD amount into the chain's payment asset.
    async fn price(&self, usd: Decimal) -> Result<NativeAmount, ChainError>;

    /// Reads what a deposit address has received.
    async fn observe(&self, address: &str) -> Result<ChainObservation, ChainError>;

    /// Builds a quote for `tier`, payable to `target`.
    async fn quote(&self, tier: &Tier, target: DepositTarget) -> Result<Quote, ChainError> {
        let amount = self.price(tier.usd).await?;
        let profile = self.profile();
        let chain = self.chain();
        Ok(Quote {
            chain,
            network: chain.chain_id(),
            credits: tier.credits,
            usd_amount: tier.usd,
            native_amount: amount.native,
            smallest_unit_amount: amount.smallest,
            deposit_address: target.deposit_address,
            payment_token: target.payment_token,
            required_confirmations: profile.required_confirmations,
            est_confirmation_secs: profile.est_confirmation_secs,
            est_fee_usd: profile.est_fee_usd,
        })
    }

    /// Verifies a deposit address against `required` smallest units.
    async fn check_status(&self, address: &str, required: u64) -> Result<PaymentStatus, ChainError> {
        let observation = self.observe(address).await?;
        Ok(self.rule().evaluate(observation, required))
    }
}

/// The configured adapters, keyed by chain.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter for its chain, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    /// Builder form of [`AdapterRegistry::register`].
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Returns the adapter for `chain`.
    ///
    /// # Errors
    ///
    /// [`CreditError::Validation`] when the chain is not offered.
    pub fn get(&self, chain: Chain) -> Result<&Arc<dyn ChainAdapter>, CreditError> {
        self.adapters
            .get(&chain)
            .ok_or_else(|| CreditError::Validation(format!("chain {chain} is not supported")))
    }

    /// Chains with a registered adapter, in declaration order.
    #[must_use]
    pub fn chains(&self) -> Vec<Chain> {
        Chain::ALL
            .into_iter()
            .filter(|c| self.adapters.contains_key(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(confirmations: u64) -> ObservedTransfer {
        ObservedTransfer {
            txid: format!("tx{confirmations}"),
            amount: Some(1),
            confirmations,
        }
    }

    #[test]
    fn test_tolerance_boundary() {
        let rule = ConfirmationRule::ConfirmedBalance;
        let exact = ChainObservation {
            total_received: 95,
            confirmed_received: 95,
            transfers: vec![transfer(1)],
        };
        let status = rule.evaluate(exact, 100);
        assert!(status.is_paid && status.is_confirmed);

        let short = ChainObservation {
            total_received: 949,
            confirmed_received: 949,
            transfers: vec![transfer(1)],
        };
        let status = rule.evaluate(short, 1_000);
        assert!(!status.is_paid && !status.is_confirmed);
    }

    #[test]
    fn test_confirmed_balance_ignores_mempool() {
        let obs = ChainObservation {
            total_received: 100,
            confirmed_received: 0,
            transfers: vec![transfer(0)],
        };
        let status = ConfirmationRule::ConfirmedBalance.evaluate(obs, 100);
        assert!(status.is_paid);
        assert!(!status.is_confirmed);
    }

    #[test]
    fn test_minimum_depth_uses_shallowest_transfer() {
        let obs = ChainObservation {
            total_received: 100_000_000,
            confirmed_received: 100_000_000,
            transfers: vec![transfer(80), transfer(63)],
        };
        let status = ConfirmationRule::MinimumDepth(64).evaluate(obs.clone(), 100_000_000);
        assert_eq!(status.confirmations, 63);
        assert!(status.is_paid);
        assert!(!status.is_confirmed);

        let status = ConfirmationRule::MinimumDepth(12).evaluate(obs, 100_000_000);
        assert!(status.is_confirmed);
    }

    #[test]
    fn test_nothing_received_is_unpaid() {
        let status =
            ConfirmationRule::MinimumDepth(0).evaluate(ChainObservation::default(), 1_000_000);
        assert_eq!(status.confirmations, 0);
        assert!(!status.is_paid && !status.is_confirmed);
    }

    #[test]
    fn test_pegged_and_spot_pricing() {
        let usdc = NativeAmount::pegged(Chain::Polygon, Decimal::from(100), 6).unwrap();
        assert_eq!(usdc.smallest, 100_000_000);
        assert_eq!(usdc.native, Decimal::from(100));

        // $100 at $60,000/BTC = 0.0016666.. BTC, rounded up to 166_667 sats.
        let btc =
            NativeAmount::at_spot(Chain::Bitcoin, Decimal::from(100), Decimal::from(60_000), 8)
                .unwrap();
        assert_eq!(btc.smallest, 166_667);
        assert_eq!(btc.native.to_string(), "0.00166667");

        assert!(
            NativeAmount::at_spot(Chain::Bitcoin, Decimal::from(1), Decimal::ZERO, 8).is_err()
        );
    }
}
