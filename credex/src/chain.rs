//! Supported blockchains and their CAIP-2 identifiers.
//!
//! - [`Chain`] - A network credits can be purchased on (`bitcoin`, `polygon`, ...)
//! - [`ChainFamily`] - The derivation and verification family a chain belongs to
//! - [`ChainId`] - A CAIP-2 compliant chain identifier (e.g., `eip155:137` for Polygon)

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// A network on which credits can be purchased.
///
/// Serializes as its lowercase name: `"bitcoin"`, `"polygon"`, `"ethereum"`, `"solana"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Bitcoin mainnet (or testnet, depending on the configured xpub).
    Bitcoin,
    /// Polygon PoS, paid in USDC.
    Polygon,
    /// Ethereum mainnet, paid in USDC.
    Ethereum,
    /// Solana mainnet, paid in USDC.
    Solana,
}

impl Chain {
    /// All supported chains, in display order.
    pub const ALL: [Self; 4] = [Self::Bitcoin, Self::Polygon, Self::Ethereum, Self::Solana];

    /// Returns the lowercase name of the chain.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::Polygon => "polygon",
            Self::Ethereum => "ethereum",
            Self::Solana => "solana",
        }
    }

    /// Returns the derivation family of the chain.
    ///
    /// Polygon and Ethereum share EVM address derivation and differ only in
    /// token contracts and confirmation depth.
    #[must_use]
    pub const fn family(&self) -> ChainFamily {
        match self {
            Self::Bitcoin => ChainFamily::Bitcoin,
            Self::Polygon | Self::Ethereum => ChainFamily::Evm,
            Self::Solana => ChainFamily::Solana,
        }
    }

    /// Returns the CAIP-2 identifier of the mainnet deployment.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        match self {
            Self::Bitcoin => ChainId::new("bip122", "000000000019d6689c085ae165831e93"),
            Self::Polygon => ChainId::new("eip155", "137"),
            Self::Ethereum => ChainId::new("eip155", "1"),
            Self::Solana => ChainId::new("solana", "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp"),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown chain name.
#[derive(Debug, thiserror::Error)]
#[error("unsupported chain '{0}', expected one of: bitcoin, polygon, ethereum, solana")]
pub struct UnknownChainError(String);

impl FromStr for Chain {
    type Err = UnknownChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Self::Bitcoin),
            "polygon" | "matic" => Ok(Self::Polygon),
            "ethereum" | "eth" => Ok(Self::Ethereum),
            "solana" | "sol" => Ok(Self::Solana),
            _ => Err(UnknownChainError(s.to_owned())),
        }
    }
}

/// Address derivation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// BIP-32 public derivation to P2PKH addresses.
    Bitcoin,
    /// secp256k1 keys hashed with keccak-256.
    Evm,
    /// ed25519 keys.
    Solana,
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bitcoin => "bitcoin",
            Self::Evm => "evm",
            Self::Solana => "solana",
        })
    }
}

/// A CAIP-2 compliant blockchain identifier.
///
/// The format is `namespace:reference` where:
///
/// - `namespace` identifies the blockchain family (e.g., `bip122`, `eip155`, `solana`)
/// - `reference` identifies the specific chain within that family
///
/// # Serialization
///
/// Serializes to/from a colon-separated string: `"eip155:137"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    namespace: String,
    reference: String,
}

impl ChainId {
    /// Creates a new chain ID from namespace and reference components.
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    /// Returns the namespace component of the chain ID.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the reference component of the chain ID.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

/// Error returned when parsing an invalid chain ID string.
#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id format {0}")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, reference)) if !namespace.is_empty() && !reference.is_empty() => {
                Ok(Self::new(namespace, reference))
            }
            _ => Err(ChainIdFormatError(s.into())),
        }
    }
}

impl Serialize for ChainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
