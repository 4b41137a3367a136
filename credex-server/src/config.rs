//! Server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4080
//! database = "credex.db"
//! master_secret = "$CREDEX_MASTER_SECRET"
//! provider_timeout_secs = 10
//!
//! [bitcoin]
//! xpub = "$CREDEX_BTC_XPUB"
//! esplora_url = "https://blockstream.info/api/"
//!
//! [evm.polygon]
//! rpc_url = "https://polygon-rpc.com"
//! confirmations = 64
//!
//! [solana]
//! rpc_url = "https://api.mainnet-beta.solana.com"
//! ```
//!
//! A chain without a section is not offered.
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The configuration path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`ServerConfig`].
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4080`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// `SQLite` database path. Without one, state lives in memory.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Hex-encoded HMAC key for EVM and Solana deposit addresses, at least
    /// 32 bytes. Required when either family is configured.
    #[serde(default)]
    pub master_secret: Option<String>,

    /// Bound on a single chain provider call, in seconds (default: `10`).
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Bitcoin settings.
    #[serde(default)]
    pub bitcoin: Option<BitcoinConfig>,

    /// EVM settings, one table per chain.
    #[serde(default)]
    pub evm: EvmConfig,

    /// Solana settings.
    #[serde(default)]
    pub solana: Option<SolanaConfig>,
}

/// `[bitcoin]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    /// Account-level extended public key (`xpub` or `tpub`).
    pub xpub: String,

    /// Expected network, `mainnet` or `testnet`. Checked against the key.
    #[serde(default)]
    pub network: Option<String>,

    /// Esplora API root (default: Blockstream).
    #[serde(default = "default_esplora_url")]
    pub esplora_url: String,

    /// CoinGecko-compatible API root.
    #[serde(default = "default_price_url")]
    pub price_url: String,

    /// How long a BTC/USD price is reused, in seconds (default: `60`).
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,
}

/// `[evm]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvmConfig {
    /// `[evm.polygon]`.
    #[serde(default)]
    pub polygon: Option<EvmChainConfig>,

    /// `[evm.ethereum]`.
    #[serde(default)]
    pub ethereum: Option<EvmChainConfig>,
}

/// `[evm.<chain>]` section. Unset values keep the network defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: Url,

    /// Required block depth.
    #[serde(default)]
    pub confirmations: Option<u64>,

    /// Blocks scanned back from the head.
    #[serde(default)]
    pub lookback_blocks: Option<u64>,

    /// Block height cache TTL in milliseconds.
    #[serde(default)]
    pub block_cache_ms: Option<u64>,
}

/// `[solana]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4080
}

const fn default_provider_timeout_secs() -> u64 {
    10
}

fn default_esplora_url() -> String {
    "https://blockstream.info/api/".to_owned()
}

fn default_price_url() -> String {
    credex_btc::PriceOracle::DEFAULT_URL.to_owned()
}

const fn default_price_ttl_secs() -> u64 {
    60
}

impl ServerConfig {
    /// Loads configuration from the path given by the `CONFIG` environment
    /// variable, falling back to `config.toml` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
        Self::load_from(path)
    }

    /// Loads configuration from a specific file path. A missing file yields
    /// the defaults.
    ///
    /// After loading, `$VAR` / `${VAR}` references are expanded from the
    /// process environment, and `HOST` / `PORT` override the file values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?
        } else {
            String::new()
        };
        let mut config = Self::parse(&content)?;

        if let Ok(host) = std::env::var("HOST")
            && let Ok(addr) = host.parse()
        {
            config.host = addr;
        }
        if let Ok(port) = std::env::var("PORT")
            && let Ok(p) = port.parse()
        {
            config.port = p;
        }
        Ok(config)
    }

    /// Parses TOML text after environment expansion.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for invalid TOML or unknown value types.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());
        Ok(toml::from_str(&expanded)?)
    }

    /// The provider call timeout.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// Expands `$VAR` and `${VAR}` references using `lookup`.
///
/// Unresolved references are left as written.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(inner) = after.strip_prefix('{') {
            match inner.find('}') {
                Some(end) => (&inner[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "SECRET" => Some("abcd".into()),
            "RPC" => Some("https://rpc.example".into()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_env_vars() {
        assert_eq!(expand_env_vars("k = \"$SECRET\"", env), "k = \"abcd\"");
        assert_eq!(expand_env_vars("${RPC}/v1", env), "https://rpc.example/v1");
        assert_eq!(expand_env_vars("$MISSING and ${MISSING}", env), "$MISSING and ${MISSING}");
        assert_eq!(expand_env_vars("cost $ 5", env), "cost $ 5");
        assert_eq!(expand_env_vars("${open", env), "${open");
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.port, 4080);
        assert_eq!(config.provider_timeout(), Duration::from_secs(10));
        assert!(config.database.is_none());
        assert!(config.bitcoin.is_none() && config.solana.is_none());
        assert!(config.evm.polygon.is_none());
    }

    #[test]
    fn test_full_file() {
        let config = ServerConfig::parse(
            r#"
            port = 9000
            database = "credex.db"
            master_secret = "00"

            [bitcoin]
            xpub = "xpub-placeholder"
            price_ttl_secs = 30

            [evm.polygon]
            rpc_url = "https://polygon.example"
            confirmations = 128
            block_cache_ms = 500

            [solana]
            rpc_url = "https://solana.example"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        let btc = config.bitcoin.unwrap();
        assert_eq!(btc.price_ttl_secs, 30);
        assert_eq!(btc.esplora_url, "https://blockstream.info/api/");
        let polygon = config.evm.polygon.unwrap();
        assert_eq!(polygon.confirmations, Some(128));
        assert_eq!(polygon.lookback_blocks, None);
        assert!(config.evm.ethereum.is_none());
        assert_eq!(config.solana.unwrap().rpc_url, "https://solana.example");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load_from("/nonexistent/credex.toml").unwrap();
        assert!(config.master_secret.is_none());
    }
}
