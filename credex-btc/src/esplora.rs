//! A read-only client for Esplora-compatible Bitcoin REST APIs
//! (Blockstream, mempool.space, self-hosted electrs).
//!
//! Only three endpoints are used:
//!
//! - `GET /address/{address}` - funded and spent sums, confirmed and mempool
//! - `GET /address/{address}/txs` - recent transactions touching the address
//! - `GET /blocks/tip/height` - current chain height, as plain text

use std::time::Duration;

use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::instrument;

/// Errors that can occur while talking to an Esplora server.
#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected HTTP status code.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// Failed to read response body.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// A plain-text response did not parse.
    #[error("Unexpected response body: {context}: {body}")]
    UnexpectedBody {
        /// Human-readable context.
        context: &'static str,
        /// The response body.
        body: String,
    },
}

/// Funding totals for one address, in satoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TxoStats {
    /// Sum of outputs paying the address.
    pub funded_txo_sum: u64,
    /// Sum of those outputs already spent.
    pub spent_txo_sum: u64,
}

impl TxoStats {
    /// Unspent balance.
    #[must_use]
    pub const fn balance(&self) -> u64 {
        self.funded_txo_sum.saturating_sub(self.spent_txo_sum)
    }
}

/// Response of `GET /address/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressInfo {
    /// Confirmed activity.
    pub chain_stats: TxoStats,
    /// Unconfirmed activity.
    pub mempool_stats: TxoStats,
}

impl AddressInfo {
    /// Confirmed plus unconfirmed balance.
    ///
    /// Mempool spends may consume confirmed outputs, so the two deltas are
    /// summed signed and only the result is clamped at zero.
    #[must_use]
    pub fn total_balance(&self) -> u64 {
        let net = i128::from(self.chain_stats.funded_txo_sum)
            - i128::from(self.chain_stats.spent_txo_sum)
            + i128::from(self.mempool_stats.funded_txo_sum)
            - i128::from(self.mempool_stats.spent_txo_sum);
        u64::try_from(net.max(0)).unwrap_or(u64::MAX)
    }

    /// Confirmed balance only.
    #[must_use]
    pub const fn confirmed_balance(&self) -> u64 {
        self.chain_stats.balance()
    }
}

/// Confirmation status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TxStatus {
    /// Whether the transaction is in a block.
    pub confirmed: bool,
    /// Height of that block.
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxOut {
    /// Address the output pays, if standard.
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    /// Value in satoshis.
    pub value: u64,
}

/// An element of `GET /address/{address}/txs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EsploraTx {
    /// Transaction id.
    pub txid: String,
    /// Confirmation status.
    pub status: TxStatus,
    /// Outputs.
    pub vout: Vec<TxOut>,
}

impl EsploraTx {
    /// Satoshis this transaction pays to `address`.
    #[must_use]
    pub fn received_by(&self, address: &str) -> u64 {
        self.vout
            .iter()
            .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
            .map(|o| o.value)
            .sum()
    }

    /// Confirmations at chain height `tip`; 0 while in the mempool.
    #[must_use]
    pub fn confirmations(&self, tip: u64) -> u64 {
        match (self.status.confirmed, self.status.block_height) {
            (true, Some(height)) => tip.saturating_sub(height).saturating_add(1),
            _ => 0,
        }
    }
}

/// An Esplora REST client.
#[derive(Clone, Debug)]
pub struct EsploraClient {
    base_url: Url,
    client: Client,
    timeout: Option<Duration>,
}

impl EsploraClient {
    /// Creates a client for the API rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            client: Client::new(),
            timeout: None,
        }
    }

    /// Sets a timeout for all future requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the base URL used by this client.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches funding totals for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`EsploraError`] if the request fails.
    #[cfg_attr(feature = "telemetry", instrument(name = "esplora.address", skip(self), err))]
    pub async fn address(&self, address: &str) -> Result<AddressInfo, EsploraError> {
        let url = self.endpoint(&format!("address/{address}"), "Failed to construct address URL")?;
        self.get_json(url, "GET /address").await
    }

    /// Fetches recent transactions touching `address`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EsploraError`] if the request fails.
    #[cfg_attr(feature = "telemetry", instrument(name = "esplora.address_txs", skip(self), err))]
    pub async fn address_txs(&self, address: &str) -> Result<Vec<EsploraTx>, EsploraError> {
        let url = self.endpoint(
            &format!("address/{address}/txs"),
            "Failed to construct address txs URL",
        )?;
        self.get_json(url, "GET /address/txs").await
    }

    /// Fetches the current chain height.
    ///
    /// # Errors
    ///
    /// Returns [`EsploraError`] if the request fails or the body is not a number.
    #[cfg_attr(feature = "telemetry", instrument(name = "esplora.tip_height", skip(self), err))]
    pub async fn tip_height(&self) -> Result<u64, EsploraError> {
        let context = "GET /blocks/tip/height";
        let url = self.endpoint("blocks/tip/height", "Failed to construct tip height URL")?;
        let response = self.send(url, context).await?;
        let body = read_ok_body(response, context).await?;
        body.trim()
            .parse()
            .map_err(|_| EsploraError::UnexpectedBody { context, body })
    }

    fn endpoint(&self, path: &str, context: &'static str) -> Result<Url, EsploraError> {
        self.base_url
            .join(path)
            .map_err(|source| EsploraError::UrlParse { context, source })
    }

    async fn send(&self, url: Url, context: &'static str) -> Result<reqwest::Response, EsploraError> {
        let mut req = self.client.get(url);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        req.send()
            .await
            .map_err(|source| EsploraError::Http { context, source })
    }

    async fn get_json<R>(&self, url: Url, context: &'static str) -> Result<R, EsploraError>
    where
        R: serde::de::DeserializeOwned,
    {
        let response = self.send(url, context).await?;
        if response.status() == StatusCode::OK {
            response
                .json::<R>()
                .await
                .map_err(|source| EsploraError::JsonDeserialization { context, source })
        } else {
            Err(status_error(response, context).await)
        }
    }
}

async fn read_ok_body(
    response: reqwest::Response,
    context: &'static str,
) -> Result<String, EsploraError> {
    if response.status() != StatusCode::OK {
        return Err(status_error(response, context).await);
    }
    response
        .text()
        .await
        .map_err(|source| EsploraError::ResponseBodyRead { context, source })
}

async fn status_error(response: reqwest::Response, context: &'static str) -> EsploraError {
    let status = response.status();
    match response.text().await {
        Ok(body) => EsploraError::HttpStatus {
            context,
            status,
            body,
        },
        Err(source) => EsploraError::ResponseBodyRead { context, source },
    }
}

/// Parses a base URL, normalizing it to end with exactly one slash so that
/// relative endpoint paths join underneath it.
impl TryFrom<&str> for EsploraClient {
    type Error = EsploraError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|source| EsploraError::UrlParse {
            context: "Failed to parse base url",
            source,
        })?;
        Ok(Self::new(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_address_stats() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/address/1abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "address": "1abc",
                "chain_stats": {"funded_txo_count": 2, "funded_txo_sum": 150_000, "spent_txo_count": 1, "spent_txo_sum": 50_000, "tx_count": 3},
                "mempool_stats": {"funded_txo_count": 1, "funded_txo_sum": 20_000, "spent_txo_count": 0, "spent_txo_sum": 0, "tx_count": 1}
            })))
            .mount(&server)
            .await;

        let client = EsploraClient::try_from(format!("{}/api", server.uri()).as_str()).unwrap();
        let info = client.address("1abc").await.unwrap();
        assert_eq!(info.confirmed_balance(), 100_000);
        assert_eq!(info.total_balance(), 120_000);
    }

    #[test]
    fn test_mempool_spend_of_confirmed_funds_nets_out() {
        let info = AddressInfo {
            chain_stats: TxoStats {
                funded_txo_sum: 100_000,
                spent_txo_sum: 0,
            },
            mempool_stats: TxoStats {
                funded_txo_sum: 0,
                spent_txo_sum: 100_000,
            },
        };
        assert_eq!(info.total_balance(), 0);
        assert_eq!(info.confirmed_balance(), 100_000);

        let partial = AddressInfo {
            mempool_stats: TxoStats {
                funded_txo_sum: 10_000,
                spent_txo_sum: 60_000,
            },
            ..info
        };
        assert_eq!(partial.total_balance(), 50_000);
    }

    #[tokio::test]
    async fn test_address_txs_and_confirmations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/address/1abc/txs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"txid": "aa", "status": {"confirmed": false}, "vout": [{"scriptpubkey_address": "1abc", "value": 700}]},
                {"txid": "bb", "status": {"confirmed": true, "block_height": 800_000}, "vout": [
                    {"scriptpubkey_address": "1abc", "value": 1_000},
                    {"scriptpubkey_address": "1other", "value": 9_000},
                    {"value": 0}
                ]}
            ])))
            .mount(&server)
            .await;

        let client = EsploraClient::try_from(server.uri().as_str()).unwrap();
        let txs = client.address_txs("1abc").await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].confirmations(800_005), 0);
        assert_eq!(txs[1].confirmations(800_005), 6);
        assert_eq!(txs[1].received_by("1abc"), 1_000);
    }

    #[tokio::test]
    async fn test_tip_height_is_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(200).set_body_string("850123\n"))
            .mount(&server)
            .await;
        let client = EsploraClient::try_from(server.uri().as_str()).unwrap();
        assert_eq!(client.tip_height().await.unwrap(), 850_123);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let client = EsploraClient::try_from(server.uri().as_str()).unwrap();
        let err = client.tip_height().await.unwrap_err();
        assert!(matches!(
            err,
            EsploraError::HttpStatus { status: StatusCode::SERVICE_UNAVAILABLE, ref body, .. } if body == "overloaded"
        ));
    }
}
