//! HMAC-based derivation of EVM deposit addresses.
//!
//! The private key for an identifier is `HMAC-SHA256(master, identifier)`.
//! Polygon and Ethereum share the family, so a payment token maps to the same
//! address on both.

use alloy_primitives::Address;
use credex::chain::ChainFamily;
use credex::derive::{AddressDeriver, MasterSecret};
use credex::error::DeriveError;
use k256::ecdsa::SigningKey;

/// Returns the address controlled by a raw secp256k1 private key.
///
/// # Errors
///
/// [`DeriveError::InvalidDerivedKey`] if the bytes are zero or not below the
/// curve order.
pub fn address_for_key(key: &[u8; 32]) -> Result<Address, DeriveError> {
    let signing = SigningKey::from_slice(key).map_err(|_| DeriveError::InvalidDerivedKey)?;
    Ok(Address::from_private_key(&signing))
}

/// [`AddressDeriver`] for the EVM family.
#[derive(Debug, Clone)]
pub struct EvmDeriver {
    secret: MasterSecret,
}

impl EvmDeriver {
    /// Creates a deriver keyed by `secret`.
    #[must_use]
    pub const fn new(secret: MasterSecret) -> Self {
        Self { secret }
    }

    /// Derives the deposit address as a typed [`Address`].
    ///
    /// # Errors
    ///
    /// See [`address_for_key`].
    pub fn address(&self, identifier: &str) -> Result<Address, DeriveError> {
        address_for_key(&self.secret.hmac_sha256(identifier.as_bytes()))
    }
}

impl AddressDeriver for EvmDeriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn derive(&self, identifier: &str) -> Result<String, DeriveError> {
        Ok(self.address(identifier)?.to_checksum(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use alloy_signer_local::PrivateKeySigner;

    #[test]
    fn test_private_key_one() {
        let mut key = [0u8; 32];
        key[31] = 1;
        assert_eq!(
            address_for_key(&key).unwrap().to_checksum(None),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_zero_key_is_rejected() {
        assert!(matches!(
            address_for_key(&[0u8; 32]),
            Err(DeriveError::InvalidDerivedKey)
        ));
    }

    #[test]
    fn test_derived_address_matches_signer() {
        let secret = MasterSecret::new([9u8; 32]).unwrap();
        let deriver = EvmDeriver::new(secret.clone());
        let key = secret.hmac_sha256(b"pay_abc");
        let signer = PrivateKeySigner::from_bytes(&B256::from(key)).unwrap();
        assert_eq!(deriver.address("pay_abc").unwrap(), signer.address());
    }

    #[test]
    fn test_derive_is_checksummed_and_stable() {
        let deriver = EvmDeriver::new(MasterSecret::new([9u8; 32]).unwrap());
        let a = deriver.derive("pay_abc").unwrap();
        assert_eq!(a, deriver.derive("pay_abc").unwrap());
        assert_ne!(a, deriver.derive("pay_abd").unwrap());
        assert!(a.starts_with("0x") && a.len() == 42);
        assert_ne!(a, a.to_lowercase());
    }
}
