//! Deterministic deposit address derivation.
//!
//! A deposit address is a pure function of a chain-family secret and an opaque
//! identifier (a payment token). Nothing per address is persisted: losing every
//! cache must never lose the ability to recover an address.
//!
//! - [`MasterSecret`] - Validated HMAC key shared by the EVM and Solana families
//! - [`AddressDeriver`] - One implementation per [`ChainFamily`], provided by
//!   the chain crates
//! - [`AddressCache`] - Optional lookup cache in front of derivation
//! - [`KeyDerivationEngine`] - Routes a family to its deriver and consults the cache

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::chain::ChainFamily;
use crate::error::DeriveError;

type HmacSha256 = Hmac<Sha256>;

/// A master secret used as the HMAC key for per-identifier key derivation.
///
/// The `Debug` representation never prints the secret.
#[derive(Clone)]
pub struct MasterSecret(Arc<[u8]>);

impl MasterSecret {
    /// Minimum accepted secret length in bytes.
    pub const MIN_LEN: usize = 32;

    /// Wraps raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError::SecretTooShort`] if fewer than
    /// [`MasterSecret::MIN_LEN`] bytes are supplied.
    pub fn new(bytes: impl AsRef<[u8]>) -> Result<Self, DeriveError> {
        let bytes = bytes.as_ref();
        if bytes.len() < Self::MIN_LEN {
            return Err(DeriveError::SecretTooShort {
                min: Self::MIN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self(Arc::from(bytes)))
    }

    /// Computes `HMAC-SHA256(secret, message)`.
    #[must_use]
    pub fn hmac_sha256(&self, message: &[u8]) -> [u8; 32] {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(message);
        mac.finalize().into_bytes().into()
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterSecret").field(&"<redacted>").finish()
    }
}

/// Derives the deposit address of one chain family.
///
/// Implementations must be pure: the same identifier always yields the same
/// address, across calls and process restarts.
pub trait AddressDeriver: Send + Sync + fmt::Debug {
    /// The family this deriver serves.
    fn family(&self) -> ChainFamily;

    /// Derives the address for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError`] if the derived key material is invalid.
    fn derive(&self, identifier: &str) -> Result<String, DeriveError>;
}

/// Optional cache of derived addresses.
///
/// A cache is never the source of truth. Any entry may be evicted at any time.
pub trait AddressCache: Send + Sync + fmt::Debug {
    /// Returns the cached address, if present.
    fn get(&self, family: ChainFamily, identifier: &str) -> Option<String>;

    /// Stores a derived address.
    fn put(&self, family: ChainFamily, identifier: &str, address: &str);
}

/// Process-local [`AddressCache`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryAddressCache {
    entries: DashMap<(ChainFamily, String), String>,
}

impl MemoryAddressCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every cached address.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl AddressCache for MemoryAddressCache {
    fn get(&self, family: ChainFamily, identifier: &str) -> Option<String> {
        self.entries
            .get(&(family, identifier.to_owned()))
            .map(|e| e.value().clone())
    }

    fn put(&self, family: ChainFamily, identifier: &str, address: &str) {
        self.entries
            .insert((family, identifier.to_owned()), address.to_owned());
    }
}

/// Routes derivation requests to the deriver of each chain family.
#[derive(Debug, Clone, Default)]
pub struct KeyDerivationEngine {
    derivers: HashMap<ChainFamily, Arc<dyn AddressDeriver>>,
    cache: Option<Arc<dyn AddressCache>>,
}

impl KeyDerivationEngine {
    /// Creates an engine with no derivers and no cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a deriver for its family, replacing any previous one.
    #[must_use]
    pub fn with_deriver(mut self, deriver: Arc<dyn AddressDeriver>) -> Self {
        self.derivers.insert(deriver.family(), deriver);
        self
    }

    /// Attaches an address cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn AddressCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns `true` if a deriver is registered for `family`.
    #[must_use]
    pub fn supports(&self, family: ChainFamily) -> bool {
        self.derivers.contains_key(&family)
    }

    /// Derives the deposit address for `identifier` in `family`.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError::UnsupportedFamily`] when no deriver is
    /// registered, or the deriver's own error.
    pub fn derive(&self, identifier: &str, family: ChainFamily) -> Result<String, DeriveError> {
        if let Some(address) = self.cache.as_ref().and_then(|c| c.get(family, identifier)) {
            return Ok(address);
        }
        let deriver = self
            .derivers
            .get(&family)
            .ok_or(DeriveError::UnsupportedFamily(family))?;
        let address = deriver.derive(identifier)?;
        if let Some(cache) = &self.cache {
            cache.put(family, identifier, &address);
        }
        Ok(address)
    }
}
