//! Read access to Solana token accounts and signature history.

use std::fmt;
use std::time::Duration;

use credex::error::ChainError;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;
use spl_token::solana_program::program_pack::Pack;

const CHAIN: &str = "solana";

/// A successful transaction that touched a watched account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    /// Base58 transaction signature.
    pub signature: String,
    /// Slot the transaction landed in.
    pub slot: u64,
}

/// Ledger queries the Solana adapter depends on.
#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync + fmt::Debug {
    /// Token balance of an SPL token account at `commitment`, zero when the
    /// account does not exist yet.
    async fn token_balance(
        &self,
        account: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<u64, ChainError>;

    /// Successful transactions involving `account`, newest first.
    async fn signatures(&self, account: &Pubkey) -> Result<Vec<SignatureInfo>, ChainError>;

    /// The current slot.
    async fn slot(&self) -> Result<u64, ChainError>;
}

/// [`LedgerSource`] over the JSON-RPC API.
pub struct RpcLedgerSource {
    client: RpcClient,
}

impl RpcLedgerSource {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Connects to `rpc_url` with `confirmed` as the default commitment.
    #[must_use]
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self::with_timeout(rpc_url, Self::DEFAULT_TIMEOUT)
    }

    /// Connects with a custom request timeout.
    #[must_use]
    pub fn with_timeout(rpc_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new_with_timeout_and_commitment(
                rpc_url.into(),
                timeout,
                CommitmentConfig::confirmed(),
            ),
        }
    }
}

impl fmt::Debug for RpcLedgerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcLedgerSource")
            .field("url", &self.client.url())
            .finish()
    }
}

fn rpc_error(err: ClientError) -> ChainError {
    ChainError::provider(CHAIN, err)
}

#[async_trait::async_trait]
impl LedgerSource for RpcLedgerSource {
    async fn token_balance(
        &self,
        account: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<u64, ChainError> {
        let response = self
            .client
            .get_account_with_commitment(account, commitment)
            .await
            .map_err(rpc_error)?;
        let Some(account) = response.value else {
            return Ok(0);
        };
        let token = spl_token::state::Account::unpack(&account.data)
            .map_err(|e| ChainError::malformed(CHAIN, format!("token account {e}")))?;
        Ok(token.amount)
    }

    async fn signatures(&self, account: &Pubkey) -> Result<Vec<SignatureInfo>, ChainError> {
        let statuses = self
            .client
            .get_signatures_for_address(account)
            .await
            .map_err(rpc_error)?;
        Ok(statuses
            .into_iter()
            .filter(|s| s.err.is_none())
            .map(|s| SignatureInfo {
                signature: s.signature,
                slot: s.slot,
            })
            .collect())
    }

    async fn slot(&self) -> Result<u64, ChainError> {
        self.client.get_slot().await.map_err(rpc_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

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

    #[tokio::test]
    async fn test_missing_token_account_has_zero_balance() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "getAccountInfo",
            json!({"context": {"slot": 10}, "value": null}),
        )
        .await;
        let source = RpcLedgerSource::new(server.uri());
        let balance = source
            .token_balance(&Pubkey::new_from_array([7; 32]), CommitmentConfig::finalized())
            .await
            .unwrap();
        assert_eq!(balance, 0);
    }

    #[tokio::test]
    async fn test_failed_transactions_are_dropped() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "getSignaturesForAddress",
            json!([
                {"signature": "sigA", "slot": 120, "err": null, "memo": null, "blockTime": null, "confirmationStatus": "confirmed"},
                {"signature": "sigB", "slot": 110, "err": {"InstructionError": [0, "InvalidAccountData"]}, "memo": null, "blockTime": null, "confirmationStatus": "finalized"}
            ]),
        )
        .await;
        mount_rpc(&server, "getSlot", json!(150)).await;
        let source = RpcLedgerSource::new(server.uri());
        let sigs = source
            .signatures(&Pubkey::new_from_array([7; 32]))
            .await
            .unwrap();
        assert_eq!(
            sigs,
            vec![SignatureInfo {
                signature: "sigA".into(),
                slot: 120
            }]
        );
        assert_eq!(source.slot().await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_rpc_failure_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let err = RpcLedgerSource::new(server.uri()).slot().await.unwrap_err();
        assert!(matches!(err, ChainError::Provider { chain: "solana", .. }));
    }
}
