use std::time::Duration;

use credex::adapter::{
    ChainAdapter, ChainObservation, ChainProfile, ConfirmationRule, NativeAmount, ObservedTransfer,
};
use credex::chain::Chain;
use credex::error::ChainError;
use rust_decimal::Decimal;

use crate::esplora::{EsploraClient, EsploraError};
use crate::price::PriceOracle;

const CHAIN: &str = "bitcoin";

impl From<EsploraError> for ChainError {
    fn from(err: EsploraError) -> Self {
        match err {
            EsploraError::JsonDeserialization { .. } | EsploraError::UnexpectedBody { .. } => {
                Self::malformed(CHAIN, err)
            }
            _ => Self::provider(CHAIN, err),
        }
    }
}

/// Bitcoin verification through Esplora, priced through a spot oracle.
///
/// Funds count once they are in a block: the confirmed balance must meet
/// tolerance on its own, mempool funds only make a payment "paid".
#[derive(Debug)]
pub struct BitcoinAdapter {
    esplora: EsploraClient,
    oracle: PriceOracle,
    profile: ChainProfile,
}

impl BitcoinAdapter {
    /// Satoshis per bitcoin, as a power of ten.
    pub const DECIMALS: u32 = 8;

    /// Default profile: one block, about ten minutes, a typical legacy fee.
    pub const DEFAULT_PROFILE: ChainProfile = ChainProfile {
        required_confirmations: 1,
        est_confirmation_secs: 600,
        est_fee_usd: Decimal::from_parts(150, 0, 0, false, 2),
        decimals: Self::DECIMALS,
    };

    /// Creates an adapter from an Esplora client and a price oracle.
    #[must_use]
    pub fn new(esplora: EsploraClient, oracle: PriceOracle) -> Self {
        Self {
            esplora,
            oracle,
            profile: Self::DEFAULT_PROFILE,
        }
    }

    /// Applies a per-request timeout to both providers.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            esplora: self.esplora.with_timeout(timeout),
            oracle: self.oracle.with_timeout(timeout),
            profile: self.profile,
        }
    }
}

#[async_trait::async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    fn profile(&self) -> ChainProfile {
        self.profile
    }

    fn rule(&self) -> ConfirmationRule {
        ConfirmationRule::ConfirmedBalance
    }

    async fn price(&self, usd: Decimal) -> Result<NativeAmount, ChainError> {
        let spot = self.oracle.btc_usd().await?;
        NativeAmount::at_spot(Chain::Bitcoin, usd, spot, Self::DECIMALS)
    }

    async fn observe(&self, address: &str) -> Result<ChainObservation, ChainError> {
        let (info, txs, tip) = tokio::try_join!(
            self.esplora.address(address),
            self.esplora.address_txs(address),
            self.esplora.tip_height(),
        )?;
        let transfers = txs
            .iter()
            .filter_map(|tx| {
                let received = tx.received_by(address);
                (received > 0).then(|| ObservedTransfer {
                    txid: tx.txid.clone(),
                    amount: Some(received),
                    confirmations: tx.confirmations(tip),
                })
            })
            .collect();
        Ok(ChainObservation {
            total_received: info.total_balance(),
            confirmed_received: info.confirmed_balance(),
            transfers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credex::adapter::DepositTarget;
    use credex::tier::Tier;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADDRESS: &str = "17RWF4Ce46W5EPoLCQR9v2YnrdzTycQjxK";

    async fn mount_chain(server: &MockServer, confirmed: u64, mempool: u64, height: Option<u64>) {
        Mock::given(method("GET"))
            .and(path(format!("/address/{ADDRESS}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "chain_stats": {"funded_txo_sum": confirmed, "spent_txo_sum": 0},
                "mempool_stats": {"funded_txo_sum": mempool, "spent_txo_sum": 0}
            })))
            .mount(server)
            .await;
        let status = height.map_or_else(
            || json!({"confirmed": false}),
            |h| json!({"confirmed": true, "block_height": h}),
        );
        Mock::given(method("GET"))
            .and(path(format!("/address/{ADDRESS}/txs")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"txid": "f00d", "status": status, "vout": [{"scriptpubkey_address": ADDRESS, "value": confirmed + mempool}]}
            ])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(200).set_body_string("840002"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"bitcoin": {"usd": 50000.0}})),
            )
            .mount(server)
            .await;
    }

    fn adapter(server: &MockServer) -> BitcoinAdapter {
        BitcoinAdapter::new(
            EsploraClient::try_from(server.uri().as_str()).unwrap(),
            PriceOracle::new(&server.uri()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_quote_prices_in_satoshis() {
        let server = MockServer::start().await;
        mount_chain(&server, 0, 0, None).await;
        let quote = adapter(&server)
            .quote(
                &Tier::for_credits(1_000).unwrap(),
                DepositTarget {
                    payment_token: "pay_x".into(),
                    deposit_address: ADDRESS.into(),
                },
            )
            .await
            .unwrap();
        // $100 / $50,000 = 0.002 BTC
        assert_eq!(quote.smallest_unit_amount, 200_000);
        assert_eq!(quote.required_confirmations, 1);
        assert_eq!(quote.network.namespace(), "bip122");
    }

    #[tokio::test]
    async fn test_mempool_funds_are_paid_not_confirmed() {
        let server = MockServer::start().await;
        mount_chain(&server, 0, 200_000, None).await;
        let status = adapter(&server).check_status(ADDRESS, 200_000).await.unwrap();
        assert!(status.is_paid);
        assert!(!status.is_confirmed);
        assert_eq!(status.confirmations, 0);
    }

    #[tokio::test]
    async fn test_confirmed_funds_within_tolerance() {
        let server = MockServer::start().await;
        mount_chain(&server, 190_000, 0, Some(840_000)).await;
        let status = adapter(&server).check_status(ADDRESS, 200_000).await.unwrap();
        assert!(status.is_paid && status.is_confirmed);
        assert_eq!(status.confirmations, 3);
        assert_eq!(status.transactions[0].amount, Some(190_000));
    }

    #[tokio::test]
    async fn test_unconfirmed_spend_is_not_paid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/address/{ADDRESS}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "chain_stats": {"funded_txo_sum": 100_000, "spent_txo_sum": 0},
                "mempool_stats": {"funded_txo_sum": 0, "spent_txo_sum": 100_000}
            })))
            .mount(&server)
            .await;
        mount_chain(&server, 100_000, 0, Some(840_000)).await;
        let status = adapter(&server).check_status(ADDRESS, 100_000).await.unwrap();
        assert_eq!(status.total_received, 0);
        assert!(!status.is_paid);
    }

    #[tokio::test]
    async fn test_provider_outage_is_an_error_not_unpaid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let err = adapter(&server).check_status(ADDRESS, 1).await.unwrap_err();
        assert!(matches!(err, ChainError::Provider { chain: "bitcoin", .. }));
    }
}
