use std::str::FromStr;
use std::time::Duration;

use credex::adapter::{
    ChainAdapter, ChainObservation, ChainProfile, ConfirmationRule, NativeAmount, ObservedTransfer,
};
use credex::chain::Chain;
use credex::error::ChainError;
use rust_decimal::Decimal;
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;

use crate::networks::{SOLANA_PROFILE, USDC_SOLANA, associated_token_address};
use crate::source::{LedgerSource, RpcLedgerSource};

/// USDC verification on Solana.
///
/// The deposit address is the owner; the adapter reads the owner's USDC
/// associated token account. The balance at `confirmed` commitment is the
/// total received, the balance at `finalized` commitment is the settled part.
#[derive(Debug)]
pub struct SolanaAdapter<S = RpcLedgerSource> {
    source: S,
    mint: Pubkey,
    profile: ChainProfile,
}

impl SolanaAdapter {
    /// Creates an adapter reading from a JSON-RPC endpoint.
    #[must_use]
    pub fn rpc(rpc_url: impl Into<String>, timeout: Duration) -> Self {
        Self::new(RpcLedgerSource::with_timeout(rpc_url, timeout))
    }
}

impl<S: LedgerSource> SolanaAdapter<S> {
    /// Creates an adapter for mainnet USDC over any ledger source.
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self {
            source,
            mint: USDC_SOLANA,
            profile: SOLANA_PROFILE,
        }
    }

    /// Watches a different SPL mint (devnet USDC, for instance).
    #[must_use]
    pub const fn with_mint(mut self, mint: Pubkey) -> Self {
        self.mint = mint;
        self
    }
}

#[async_trait::async_trait]
impl<S: LedgerSource> ChainAdapter for SolanaAdapter<S> {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn profile(&self) -> ChainProfile {
        self.profile
    }

    fn rule(&self) -> ConfirmationRule {
        ConfirmationRule::ConfirmedBalance
    }

    async fn price(&self, usd: Decimal) -> Result<NativeAmount, ChainError> {
        NativeAmount::pegged(Chain::Solana, usd, self.profile.decimals)
    }

    #[cfg_attr(feature = "telemetry", tracing::instrument(skip(self), err))]
    async fn observe(&self, address: &str) -> Result<ChainObservation, ChainError> {
        let owner = Pubkey::from_str(address).map_err(|_| ChainError::InvalidAddress {
            chain: Chain::Solana.as_str(),
            address: address.to_owned(),
        })?;
        let ata = associated_token_address(&owner, &self.mint);
        let (total_received, confirmed_received, signatures, slot) = tokio::try_join!(
            self.source.token_balance(&ata, CommitmentConfig::confirmed()),
            self.source.token_balance(&ata, CommitmentConfig::finalized()),
            self.source.signatures(&ata),
            self.source.slot(),
        )?;
        let transfers = signatures
            .into_iter()
            .map(|sig| ObservedTransfer {
                txid: sig.signature,
                amount: None,
                confirmations: slot.saturating_sub(sig.slot).saturating_add(1),
            })
            .collect();
        Ok(ChainObservation {
            total_received,
            confirmed_received,
            transfers,
        })
    }
}
