//! BTC/USD spot price from a CoinGecko-compatible `simple/price` endpoint.

use std::time::Duration;

use credex::cache::TtlCache;
use http::StatusCode;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::esplora::EsploraError;

#[derive(Debug, Deserialize)]
struct SimplePrice {
    bitcoin: UsdQuote,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: f64,
}

/// Fetches and briefly caches the BTC/USD spot price.
///
/// Reuses [`EsploraError`] for transport failures since both are plain JSON
/// over HTTP.
#[derive(Debug)]
pub struct PriceOracle {
    url: Url,
    client: Client,
    timeout: Option<Duration>,
    cache: TtlCache<Decimal>,
}

impl PriceOracle {
    /// Public CoinGecko API root.
    pub const DEFAULT_URL: &'static str = "https://api.coingecko.com/api/v3/";
    /// Default time a fetched price stays valid.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    /// Creates an oracle for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// [`EsploraError::UrlParse`] if the endpoint URL cannot be built.
    pub fn new(base_url: &str) -> Result<Self, EsploraError> {
        let mut normalized = base_url.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized)
            .and_then(|u| u.join("simple/price?ids=bitcoin&vs_currencies=usd"))
            .map_err(|source| EsploraError::UrlParse {
                context: "Failed to construct price URL",
                source,
            })?;
        Ok(Self {
            url,
            client: Client::new(),
            timeout: None,
            cache: TtlCache::new(Self::DEFAULT_TTL),
        })
    }

    /// Sets a timeout for all future requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how long a fetched price is reused. Zero disables caching.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache = TtlCache::new(ttl);
        self
    }

    /// Returns the USD price of one bitcoin.
    ///
    /// # Errors
    ///
    /// Returns [`EsploraError`] if the request fails or the price is unusable.
    pub async fn btc_usd(&self) -> Result<Decimal, EsploraError> {
        if let Some(price) = self.cache.get().await {
            return Ok(price);
        }
        let context = "GET /simple/price";
        let mut req = self.client.get(self.url.clone());
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req
            .send()
            .await
            .map_err(|source| EsploraError::Http { context, source })?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .map_err(|source| EsploraError::ResponseBodyRead { context, source })?;
            return Err(EsploraError::HttpStatus {
                context,
                status,
                body,
            });
        }
        let quote: SimplePrice = response
            .json()
            .await
            .map_err(|source| EsploraError::JsonDeserialization { context, source })?;
        let price = Decimal::try_from(quote.bitcoin.usd)
            .ok()
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| EsploraError::UnexpectedBody {
                context,
                body: quote.bitcoin.usd.to_string(),
            })?;
        #[cfg(feature = "telemetry")]
        tracing::debug!(%price, "btc price refreshed");
        self.cache.set(price).await;
        Ok(price)
    }
}
