//! Known EVM networks and their USDC deployments.

use std::time::Duration;

use alloy_primitives::{Address, address};
use credex::adapter::ChainProfile;
use credex::chain::Chain;
use rust_decimal::Decimal;

/// Polygon Mainnet chain ID.
pub const POLYGON_MAINNET: u64 = 137;

/// Ethereum Mainnet chain ID.
pub const ETHEREUM_MAINNET: u64 = 1;

/// Native USDC contract address on Polygon Mainnet.
pub const USDC_POLYGON: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");

/// Bridged USDC (USDC.e) contract address on Polygon Mainnet.
pub const USDC_POLYGON_BRIDGED: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

/// USDC contract address on Ethereum Mainnet.
pub const USDC_ETHEREUM: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

/// Token decimals for USDC on every supported network.
pub const USDC_DECIMALS: u32 = 6;

/// Static configuration of one supported EVM network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmNetwork {
    /// The chain this network serves.
    pub chain: Chain,
    /// EIP-155 chain ID.
    pub chain_id: u64,
    /// USDC token contracts whose transfers count as payment.
    pub tokens: Vec<Address>,
    /// Quote profile; `required_confirmations` is the minimum block depth.
    pub profile: ChainProfile,
    /// How far back from the head to scan for transfers.
    pub lookback_blocks: u64,
    /// How long a fetched block height is reused.
    pub block_cache: Duration,
}

impl EvmNetwork {
    /// Default scan window, in blocks.
    pub const DEFAULT_LOOKBACK_BLOCKS: u64 = 5_000;
    /// Default block height cache TTL.
    pub const DEFAULT_BLOCK_CACHE: Duration = Duration::from_secs(2);

    /// Polygon PoS: native USDC and USDC.e, 64 blocks at roughly 2s each.
    #[must_use]
    pub fn polygon() -> Self {
        Self {
            chain: Chain::Polygon,
            chain_id: POLYGON_MAINNET,
            tokens: vec![USDC_POLYGON, USDC_POLYGON_BRIDGED],
            profile: ChainProfile {
                required_confirmations: 64,
                est_confirmation_secs: 128,
                est_fee_usd: Decimal::new(1, 2),
                decimals: USDC_DECIMALS,
            },
            lookback_blocks: Self::DEFAULT_LOOKBACK_BLOCKS,
            block_cache: Self::DEFAULT_BLOCK_CACHE,
        }
    }

    /// Ethereum mainnet: USDC, 12 blocks at 12s each.
    #[must_use]
    pub fn ethereum() -> Self {
        Self {
            chain: Chain::Ethereum,
            chain_id: ETHEREUM_MAINNET,
            tokens: vec![USDC_ETHEREUM],
            profile: ChainProfile {
                required_confirmations: 12,
                est_confirmation_secs: 144,
                est_fee_usd: Decimal::new(200, 2),
                decimals: USDC_DECIMALS,
            },
            lookback_blocks: Self::DEFAULT_LOOKBACK_BLOCKS,
            block_cache: Self::DEFAULT_BLOCK_CACHE,
        }
    }

    /// Returns the default configuration for an EVM chain, `None` otherwise.
    #[must_use]
    pub fn for_chain(chain: Chain) -> Option<Self> {
        match chain {
            Chain::Polygon => Some(Self::polygon()),
            Chain::Ethereum => Some(Self::ethereum()),
            Chain::Bitcoin | Chain::Solana => None,
        }
    }

    /// Overrides the required block depth.
    #[must_use]
    pub const fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.profile.required_confirmations = confirmations;
        self
    }

    /// Overrides the scan window.
    #[must_use]
    pub const fn with_lookback_blocks(mut self, blocks: u64) -> Self {
        self.lookback_blocks = blocks;
        self
    }

    /// Overrides the block height cache TTL.
    #[must_use]
    pub const fn with_block_cache(mut self, ttl: Duration) -> Self {
        self.block_cache = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_watches_native_and_bridged_usdc() {
        let polygon = EvmNetwork::polygon();
        assert_eq!(polygon.tokens, vec![USDC_POLYGON, USDC_POLYGON_BRIDGED]);
        assert_eq!(polygon.profile.required_confirmations, 64);
        assert_eq!(
            polygon.chain.chain_id().reference(),
            polygon.chain_id.to_string()
        );
    }

    #[test]
    fn test_for_chain_only_covers_evm() {
        assert_eq!(EvmNetwork::for_chain(Chain::Ethereum), Some(EvmNetwork::ethereum()));
        assert!(EvmNetwork::for_chain(Chain::Solana).is_none());
        let eth = EvmNetwork::ethereum().with_confirmations(3);
        assert_eq!(eth.profile.required_confirmations, 3);
    }
}
