use std::str::FromStr;

use alloy_primitives::Address;
use credex::adapter::{
    ChainAdapter, ChainObservation, ChainProfile, ConfirmationRule, NativeAmount, ObservedTransfer,
};
use credex::cache::TtlCache;
use credex::chain::Chain;
use credex::error::ChainError;
use rust_decimal::Decimal;
use url::Url;

use crate::networks::EvmNetwork;
use crate::source::{RpcTransferSource, TransferSource};

/// USDC verification on an EVM chain through `Transfer` logs.
///
/// A transfer at block `b` has `head - b + 1` confirmations. A payment is
/// confirmed once it is paid and every transfer into the address is at least
/// as deep as the network requires. Only the last
/// [`EvmNetwork::lookback_blocks`] blocks are scanned.
#[derive(Debug)]
pub struct EvmAdapter<S = RpcTransferSource> {
    network: EvmNetwork,
    source: S,
    head: TtlCache<u64>,
}

impl EvmAdapter {
    /// Creates an adapter reading from a JSON-RPC endpoint over HTTP.
    #[must_use]
    pub fn http(network: EvmNetwork, rpc_url: Url) -> Self {
        let source = RpcTransferSource::http(network.chain, rpc_url);
        Self::new(network, source)
    }
}

impl<S: TransferSource> EvmAdapter<S> {
    /// Creates an adapter over any transfer source.
    #[must_use]
    pub fn new(network: EvmNetwork, source: S) -> Self {
        let head = TtlCache::new(network.block_cache);
        Self {
            network,
            source,
            head,
        }
    }

    /// The network configuration in use.
    #[must_use]
    pub const fn network(&self) -> &EvmNetwork {
        &self.network
    }

    async fn head(&self) -> Result<u64, ChainError> {
        if let Some(head) = self.head.get().await {
            return Ok(head);
        }
        let head = self.source.block_number().await?;
        self.head.set(head).await;
        Ok(head)
    }
}

#[async_trait::async_trait]
impl<S: TransferSource> ChainAdapter for EvmAdapter<S> {
    fn chain(&self) -> Chain {
        self.network.chain
    }

    fn profile(&self) -> ChainProfile {
        self.network.profile
    }

    fn rule(&self) -> ConfirmationRule {
        ConfirmationRule::MinimumDepth(self.network.profile.required_confirmations)
    }

    async fn price(&self, usd: Decimal) -> Result<NativeAmount, ChainError> {
        NativeAmount::pegged(self.network.chain, usd, self.network.profile.decimals)
    }

    #[cfg_attr(
        feature = "telemetry",
        tracing::instrument(skip(self), fields(chain = %self.network.chain), err)
    )]
    async fn observe(&self, address: &str) -> Result<ChainObservation, ChainError> {
        let chain = self.network.chain.as_str();
        let to = Address::from_str(address).map_err(|_| ChainError::InvalidAddress {
            chain,
            address: address.to_owned(),
        })?;
        let head = self.head().await?;
        let from_block = head.saturating_sub(self.network.lookback_blocks);
        let logs = self
            .source
            .transfers_to(&self.network.tokens, to, from_block)
            .await?;

        let depth = self.network.profile.required_confirmations;
        let mut observation = ChainObservation::default();
        for log in logs {
            // The cached head may trail a freshly mined log by a block or two.
            let confirmations = head.saturating_sub(log.block_number).saturating_add(1);
            observation.total_received = observation.total_received.saturating_add(log.value);
            if confirmations >= depth {
                observation.confirmed_received =
                    observation.confirmed_received.saturating_add(log.value);
            }
            observation.transfers.push(ObservedTransfer {
                txid: log.tx_hash.to_string(),
                amount: Some(log.value),
                confirmations,
            });
        }
        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use alloy_primitives::B256;
    use credex::adapter::DepositTarget;
    use credex::tier::Tier;

    use crate::networks::{USDC_POLYGON, USDC_POLYGON_BRIDGED};
    use crate::source::TokenTransfer;

    const PAYEE: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";

    #[derive(Debug, Default)]
    struct FakeSource {
        head: AtomicU64,
        head_calls: AtomicUsize,
        transfers: Mutex<Vec<TokenTransfer>>,
        last_from: AtomicU64,
    }

    impl FakeSource {
        fn with(head: u64, transfers: Vec<TokenTransfer>) -> Self {
            Self {
                head: AtomicU64::new(head),
                transfers: Mutex::new(transfers),
                ..Self::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl TransferSource for FakeSource {
        async fn block_number(&self) -> Result<u64, ChainError> {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn transfers_to(
            &self,
            tokens: &[Address],
            to: Address,
            from_block: u64,
        ) -> Result<Vec<TokenTransfer>, ChainError> {
            assert_eq!(to, Address::from_str(PAYEE).unwrap());
            assert!(tokens.contains(&USDC_POLYGON));
            self.last_from.store(from_block, Ordering::SeqCst);
            Ok(self.transfers.lock().unwrap().clone())
        }
    }

    fn transfer(token: Address, block_number: u64, value: u64) -> TokenTransfer {
        TokenTransfer {
            token,
            tx_hash: B256::repeat_byte(0xaa),
            block_number,
            value,
        }
    }

    #[tokio::test]
    async fn test_quote_is_pegged_to_usdc() {
        let adapter = EvmAdapter::new(EvmNetwork::polygon(), FakeSource::with(0, vec![]));
        let quote = adapter
            .quote(
                &Tier::for_credits(1_000).unwrap(),
                DepositTarget {
                    payment_token: "pay_x".into(),
                    deposit_address: PAYEE.into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(quote.smallest_unit_amount, 100_000_000);
        assert_eq!(quote.native_amount, Decimal::new(100, 0));
        assert_eq!(quote.required_confirmations, 64);
    }

    #[tokio::test]
    async fn test_depth_gates_confirmation() {
        let source = FakeSource::with(1_000, vec![transfer(USDC_POLYGON, 950, 10_000_000)]);
        let adapter = EvmAdapter::new(
            EvmNetwork::polygon().with_block_cache(Duration::ZERO),
            source,
        );
        let status = adapter.check_status(PAYEE, 10_000_000).await.unwrap();
        assert!(status.is_paid);
        assert!(!status.is_confirmed);
        assert_eq!(status.confirmations, 51);
        assert_eq!(status.confirmed_received, 0);

        adapter.source.head.store(1_013, Ordering::SeqCst);
        let status = adapter.check_status(PAYEE, 10_000_000).await.unwrap();
        assert!(status.is_confirmed);
        assert_eq!(status.confirmations, 64);
        assert_eq!(status.confirmed_received, 10_000_000);
    }

    #[tokio::test]
    async fn test_native_and_bridged_transfers_add_up() {
        let source = FakeSource::with(
            2_000,
            vec![
                transfer(USDC_POLYGON, 1_000, 6_000_000),
                transfer(USDC_POLYGON_BRIDGED, 1_100, 4_000_000),
            ],
        );
        let adapter = EvmAdapter::new(EvmNetwork::polygon(), source);
        let status = adapter.check_status(PAYEE, 10_000_000).await.unwrap();
        assert_eq!(status.total_received, 10_000_000);
        assert!(status.is_confirmed);
        assert_eq!(status.transactions.len(), 2);
    }

    #[tokio::test]
    async fn test_underpayment_is_not_paid() {
        let source = FakeSource::with(2_000, vec![transfer(USDC_POLYGON, 1_000, 9_000_000)]);
        let adapter = EvmAdapter::new(EvmNetwork::polygon(), source);
        let status = adapter.check_status(PAYEE, 10_000_000).await.unwrap();
        assert!(!status.is_paid && !status.is_confirmed);
    }

    #[tokio::test]
    async fn test_head_is_cached_and_window_applied() {
        let source = FakeSource::with(10_000, vec![]);
        let adapter = EvmAdapter::new(
            EvmNetwork::polygon()
                .with_lookback_blocks(1_000)
                .with_block_cache(Duration::from_secs(60)),
            source,
        );
        adapter.observe(PAYEE).await.unwrap();
        adapter.observe(PAYEE).await.unwrap();
        assert_eq!(adapter.source.head_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.source.last_from.load(Ordering::SeqCst), 9_000);
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let adapter = EvmAdapter::new(EvmNetwork::polygon(), FakeSource::with(1, vec![]));
        let err = adapter.observe("not-an-address").await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidAddress { chain: "polygon", .. }));
    }
}
