//! Application state and its construction from [`ServerConfig`].

use std::sync::Arc;
use std::time::Duration;

use credex::adapter::AdapterRegistry;
use credex::derive::{KeyDerivationEngine, MasterSecret, MemoryAddressCache};
use credex::error::CreditError;
use credex::escrow::EscrowLedger;
use credex::ledger::CreditLedger;
use credex::settlement::SettlementService;
use credex::store::{CreditStore, MemoryStore, SqliteStore};
use credex_btc::{BitcoinAdapter, BitcoinDeriver, EsploraClient, PriceOracle};
use credex_evm::{EvmAdapter, EvmDeriver, EvmNetwork};
use credex_svm::{SolanaAdapter, SolanaDeriver};

use crate::config::{BitcoinConfig, EvmChainConfig, ServerConfig};

/// Services shared by every request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Purchase orchestration.
    pub settlement: SettlementService,
    /// Balances and history.
    pub ledger: CreditLedger,
    /// Escrow holds.
    pub escrow: EscrowLedger,
}

/// Shared handle passed to handlers.
pub type CreditState = Arc<AppState>;

impl AppState {
    /// Wires the services over one store.
    #[must_use]
    pub fn new(
        store: Arc<dyn CreditStore>,
        adapters: AdapterRegistry,
        deriver: KeyDerivationEngine,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            settlement: SettlementService::new(Arc::clone(&store), adapters, deriver)
                .with_provider_timeout(provider_timeout),
            ledger: CreditLedger::new(Arc::clone(&store)),
            escrow: EscrowLedger::new(store),
        }
    }

    /// Builds the store, derivers, and adapters described by `config`.
    ///
    /// # Errors
    ///
    /// [`CreditError::Config`] for an invalid secret, key, or URL, and
    /// [`CreditError::Storage`] if the database cannot be opened.
    pub fn from_config(config: &ServerConfig) -> Result<Self, CreditError> {
        let store: Arc<dyn CreditStore> = match &config.database {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => {
                tracing::warn!("no database configured, state is kept in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let timeout = config.provider_timeout();
        let mut adapters = AdapterRegistry::new();
        let mut deriver = KeyDerivationEngine::new().with_cache(Arc::new(MemoryAddressCache::new()));

        if let Some(btc) = &config.bitcoin {
            let (adapter, btc_deriver) = bitcoin(btc, timeout)?;
            adapters.register(Arc::new(adapter));
            deriver = deriver.with_deriver(Arc::new(btc_deriver));
        }

        let evm_chains = [
            (EvmNetwork::polygon(), config.evm.polygon.as_ref()),
            (EvmNetwork::ethereum(), config.evm.ethereum.as_ref()),
        ];
        let wants_secret =
            evm_chains.iter().any(|(_, c)| c.is_some()) || config.solana.is_some();
        if wants_secret {
            let secret = master_secret(config.master_secret.as_deref())?;
            if evm_chains.iter().any(|(_, c)| c.is_some()) {
                deriver = deriver.with_deriver(Arc::new(EvmDeriver::new(secret.clone())));
            }
            for (network, chain_config) in evm_chains {
                if let Some(chain_config) = chain_config {
                    let network = evm_network(network, chain_config);
                    tracing::info!(chain = %network.chain, rpc = %chain_config.rpc_url, "evm adapter registered");
                    adapters.register(Arc::new(EvmAdapter::http(network, chain_config.rpc_url.clone())));
                }
            }
            if let Some(solana) = &config.solana {
                deriver = deriver.with_deriver(Arc::new(SolanaDeriver::new(secret)));
                adapters.register(Arc::new(SolanaAdapter::rpc(solana.rpc_url.clone(), timeout)));
                tracing::info!(rpc = %solana.rpc_url, "solana adapter registered");
            }
        }

        if adapters.chains().is_empty() {
            tracing::warn!("no chains configured, purchases are disabled");
        }
        Ok(Self::new(store, adapters, deriver, timeout))
    }
}

fn master_secret(raw: Option<&str>) -> Result<MasterSecret, CreditError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('$'))
        .ok_or_else(|| CreditError::Config("master_secret is not set".into()))?;
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| CreditError::Config(format!("master_secret is not valid hex: {e}")))?;
    Ok(MasterSecret::new(bytes)?)
}

fn bitcoin(
    config: &BitcoinConfig,
    timeout: Duration,
) -> Result<(BitcoinAdapter, BitcoinDeriver), CreditError> {
    let deriver = BitcoinDeriver::new(config.xpub.trim())?;
    if let Some(expected) = &config.network
        && !expected.eq_ignore_ascii_case(&deriver.network().to_string())
    {
        return Err(CreditError::Config(format!(
            "bitcoin network is {expected} but the xpub is for {}",
            deriver.network()
        )));
    }
    let esplora = EsploraClient::try_from(config.esplora_url.as_str())
        .map_err(|e| CreditError::Config(e.to_string()))?;
    let oracle = PriceOracle::new(&config.price_url)
        .map_err(|e| CreditError::Config(e.to_string()))?
        .with_ttl(Duration::from_secs(config.price_ttl_secs));
    tracing::info!(network = %deriver.network(), esplora = %config.esplora_url, "bitcoin adapter registered");
    Ok((BitcoinAdapter::new(esplora, oracle).with_timeout(timeout), deriver))
}

fn evm_network(mut network: EvmNetwork, config: &EvmChainConfig) -> EvmNetwork {
    if let Some(confirmations) = config.confirmations {
        network = network.with_confirmations(confirmations);
    }
    if let Some(blocks) = config.lookback_blocks {
        network = network.with_lookback_blocks(blocks);
    }
    if let Some(ms) = config.block_cache_ms {
        network = network.with_block_cache(Duration::from_millis(ms));
    }
    network
}

#[cfg(test)]
mod tests {
    use super::*;
    use credex::chain::Chain;

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_master_secret_parsing() {
        assert!(master_secret(Some(SECRET)).is_ok());
        assert!(matches!(master_secret(None), Err(CreditError::Config(_))));
        assert!(matches!(
            master_secret(Some("$CREDEX_MASTER_SECRET")),
            Err(CreditError::Config(_))
        ));
        assert!(matches!(master_secret(Some("0102")), Err(CreditError::Config(_))));
        assert!(matches!(master_secret(Some("zz")), Err(CreditError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_registers_configured_chains() {
        let config = ServerConfig::parse(&format!(
            r#"
            master_secret = "{SECRET}"
            [evm.polygon]
            rpc_url = "http://127.0.0.1:1"
            [solana]
            rpc_url = "http://127.0.0.1:1"
            "#
        ))
        .unwrap();
        let state = AppState::from_config(&config).unwrap();
        let mut chains = state.settlement.chains();
        chains.sort();
        assert_eq!(chains, vec![Chain::Polygon, Chain::Solana]);
    }

    #[test]
    fn test_evm_without_secret_fails() {
        let config = ServerConfig::parse(
            r#"
            [evm.ethereum]
            rpc_url = "http://127.0.0.1:1"
            "#,
        )
        .unwrap();
        assert!(matches!(
            AppState::from_config(&config),
            Err(CreditError::Config(_))
        ));
    }

    #[test]
    fn test_evm_overrides() {
        let config: EvmChainConfig = toml::from_str(
            r#"
            rpc_url = "http://127.0.0.1:1"
            confirmations = 3
            block_cache_ms = 0
            "#,
        )
        .unwrap();
        let network = evm_network(EvmNetwork::polygon(), &config);
        assert_eq!(network.profile.required_confirmations, 3);
        assert_eq!(network.block_cache, Duration::ZERO);
        assert_eq!(network.lookback_blocks, EvmNetwork::DEFAULT_LOOKBACK_BLOCKS);
    }
}
