//! ERC-20 `Transfer` log queries.
//!
//! [`TransferSource`] is the seam between the adapter and the JSON-RPC node.
//! [`RpcTransferSource`] implements it over any alloy [`Provider`].

use std::fmt::Debug;

use alloy_primitives::{Address, B256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::Filter;
use alloy_sol_types::{SolEvent, sol};
use alloy_transport::TransportError;
use credex::chain::Chain;
use credex::error::ChainError;
use url::Url;

sol! {
    /// The ERC-20 `Transfer` event.
    #[allow(missing_docs)]
    #[derive(Debug)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// A mined token transfer into a watched address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    /// The token contract that emitted the event.
    pub token: Address,
    /// Hash of the transaction carrying the transfer.
    pub tx_hash: B256,
    /// Block that included the transaction.
    pub block_number: u64,
    /// Amount in token base units, saturated to `u64`.
    pub value: u64,
}

/// Read access to the chain head and token transfer logs.
#[async_trait::async_trait]
pub trait TransferSource: Send + Sync + Debug {
    /// Returns the latest block number.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Returns mined transfers of any of `tokens` to `to`, from `from_block` on.
    async fn transfers_to(
        &self,
        tokens: &[Address],
        to: Address,
        from_block: u64,
    ) -> Result<Vec<TokenTransfer>, ChainError>;
}

/// [`TransferSource`] backed by an alloy provider.
#[derive(Debug, Clone)]
pub struct RpcTransferSource<P = RootProvider> {
    chain: Chain,
    provider: P,
}

impl RpcTransferSource {
    /// Connects to a JSON-RPC endpoint over HTTP.
    #[must_use]
    pub fn http(chain: Chain, rpc_url: Url) -> Self {
        Self::new(chain, RootProvider::new_http(rpc_url))
    }
}

impl<P> RpcTransferSource<P> {
    /// Wraps an existing provider.
    pub const fn new(chain: Chain, provider: P) -> Self {
        Self { chain, provider }
    }
}

fn rpc_error(chain: Chain) -> impl Fn(TransportError) -> ChainError {
    move |err| ChainError::provider(chain.as_str(), err)
}

#[async_trait::async_trait]
impl<P> TransferSource for RpcTransferSource<P>
where
    P: Provider + Debug,
{
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(rpc_error(self.chain))
    }

    async fn transfers_to(
        &self,
        tokens: &[Address],
        to: Address,
        from_block: u64,
    ) -> Result<Vec<TokenTransfer>, ChainError> {
        let filter = Filter::new()
            .address(tokens.to_vec())
            .event_signature(Transfer::SIGNATURE_HASH)
            .topic2(to.into_word())
            .from_block(from_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(rpc_error(self.chain))?;

        let chain = self.chain.as_str();
        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            // Pending and reorged-out logs do not count.
            if log.removed {
                continue;
            }
            let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number)
            else {
                continue;
            };
            let decoded = log
                .log_decode::<Transfer>()
                .map_err(|e| ChainError::malformed(chain, e))?;
            transfers.push(TokenTransfer {
                token: log.address(),
                tx_hash,
                block_number,
                value: decoded.inner.data.value.saturating_to::<u64>(),
            });
        }
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{U256, address, hex};
    use serde_json::{Value, json};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use crate::networks::USDC_POLYGON;

    const PAYEE: Address = address!("7E5F4552091A69125d5DfCb7b8C2659029395Bdf");

    async fn mount_rpc(server: &MockServer, rpc_method: &'static str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": rpc_method})))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": result,
                }))
            })
            .mount(server)
            .await;
    }

    fn transfer_log(block: Option<&str>, value: u64) -> Value {
        json!({
            "address": hex::encode_prefixed(USDC_POLYGON),
            "topics": [
                hex::encode_prefixed(Transfer::SIGNATURE_HASH),
                hex::encode_prefixed(Address::repeat_byte(0x11).into_word()),
                hex::encode_prefixed(PAYEE.into_word()),
            ],
            "data": hex::encode_prefixed(U256::from(value).to_be_bytes::<32>()),
            "blockNumber": block,
            "blockHash": block.map(|_| hex::encode_prefixed([0xbb; 32])),
            "transactionHash": block.map(|_| hex::encode_prefixed([0xaa; 32])),
            "transactionIndex": block.map(|_| "0x0"),
            "logIndex": block.map(|_| "0x0"),
            "removed": false
        })
    }

    fn source(server: &MockServer) -> RpcTransferSource {
        RpcTransferSource::http(Chain::Polygon, server.uri().parse().unwrap())
    }

    #[tokio::test]
    async fn test_block_number() {
        let server = MockServer::start().await;
        mount_rpc(&server, "eth_blockNumber", json!("0x3e8")).await;
        assert_eq!(source(&server).block_number().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_transfers_skip_pending_logs() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "eth_getLogs",
            json!([transfer_log(Some("0x64"), 5_000_000), transfer_log(None, 7)]),
        )
        .await;
        let transfers = source(&server)
            .transfers_to(&[USDC_POLYGON], PAYEE, 0)
            .await
            .unwrap();
        assert_eq!(
            transfers,
            vec![TokenTransfer {
                token: USDC_POLYGON,
                tx_hash: B256::repeat_byte(0xaa),
                block_number: 100,
                value: 5_000_000,
            }]
        );
    }

    #[tokio::test]
    async fn test_rpc_failure_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = source(&server).block_number().await.unwrap_err();
        assert!(matches!(err, ChainError::Provider { chain: "polygon", .. }));
    }
}
