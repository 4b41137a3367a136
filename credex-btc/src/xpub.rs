//! Watch-only BIP-32 public derivation and P2PKH encoding.
//!
//! Deposit addresses are derived from an account-level extended public key
//! along `m/0/index`, where `index` is the first 31 bits of
//! `sha256(identifier)`. Only public child derivation is used, so no private
//! key ever exists in this process.

use std::fmt;
use std::str::FromStr;

use credex::chain::ChainFamily;
use credex::derive::AddressDeriver;
use credex::error::DeriveError;
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Serialized length of an extended key, without checksum.
const EXTENDED_KEY_LEN: usize = 78;
/// First hardened child index.
const HARDENED: u32 = 0x8000_0000;
/// External (receiving) chain under the account key.
const EXTERNAL_CHAIN: u32 = 0;

/// Bitcoin network an extended key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitcoinNetwork {
    /// Mainnet (`xpub`, addresses starting with `1`).
    Mainnet,
    /// Testnet (`tpub`, addresses starting with `m` or `n`).
    Testnet,
}

impl BitcoinNetwork {
    const fn xpub_version(self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0x04, 0x88, 0xB2, 0x1E],
            Self::Testnet => [0x04, 0x35, 0x87, 0xCF],
        }
    }

    const fn p2pkh_version(self) -> u8 {
        match self {
            Self::Mainnet => 0x00,
            Self::Testnet => 0x6f,
        }
    }

    fn from_xpub_version(version: [u8; 4]) -> Option<Self> {
        [Self::Mainnet, Self::Testnet]
            .into_iter()
            .find(|n| n.xpub_version() == version)
    }
}

impl fmt::Display for BitcoinNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        })
    }
}

/// An extended public key: a compressed secp256k1 point and its chain code.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedPubKey {
    network: BitcoinNetwork,
    depth: u8,
    public_key: [u8; 33],
    chain_code: [u8; 32],
}

impl fmt::Debug for ExtendedPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPubKey")
            .field("network", &self.network)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl FromStr for ExtendedPubKey {
    type Err = DeriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| DeriveError::InvalidExtendedKey(msg.to_owned());
        let raw = bs58::decode(s.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| DeriveError::InvalidExtendedKey(e.to_string()))?;
        if raw.len() != EXTENDED_KEY_LEN {
            return Err(invalid("expected 78 bytes"));
        }
        let version: [u8; 4] = raw[0..4].try_into().map_err(|_| invalid("bad version"))?;
        let network = BitcoinNetwork::from_xpub_version(version)
            .ok_or_else(|| invalid("not an xpub or tpub"))?;
        let chain_code: [u8; 32] = raw[13..45]
            .try_into()
            .map_err(|_| invalid("bad chain code"))?;
        let public_key: [u8; 33] = raw[45..78]
            .try_into()
            .map_err(|_| invalid("bad public key"))?;
        PublicKey::from_sec1_bytes(&public_key)
            .map_err(|_| invalid("public key is not a valid compressed point"))?;
        Ok(Self {
            network,
            depth: raw[4],
            public_key,
            chain_code,
        })
    }
}

impl ExtendedPubKey {
    /// Network encoded in the key's version bytes.
    #[must_use]
    pub const fn network(&self) -> BitcoinNetwork {
        self.network
    }

    /// Compressed SEC1 public key.
    #[must_use]
    pub const fn public_key(&self) -> &[u8; 33] {
        &self.public_key
    }

    /// Public child derivation (BIP-32 `CKDpub`).
    ///
    /// # Errors
    ///
    /// - [`DeriveError::InvalidExtendedKey`] for a hardened index
    /// - [`DeriveError::InvalidDerivedKey`] if `I_L` is out of range or the
    ///   child is the point at infinity
    pub fn child(&self, index: u32) -> Result<Self, DeriveError> {
        if index >= HARDENED {
            return Err(DeriveError::InvalidExtendedKey(
                "hardened children cannot be derived from a public key".into(),
            ));
        }
        let mut mac = <HmacSha512 as Mac>::new_from_slice(&self.chain_code)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(&self.public_key);
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let (il, ir) = digest.split_at(32);

        let tweak = SecretKey::from_slice(il).map_err(|_| DeriveError::InvalidDerivedKey)?;
        let parent = PublicKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| DeriveError::InvalidDerivedKey)?;
        let point = parent.to_projective() + tweak.public_key().to_projective();
        let child = PublicKey::from_affine(point.to_affine())
            .map_err(|_| DeriveError::InvalidDerivedKey)?;

        let public_key: [u8; 33] = child
            .to_encoded_point(true)
            .as_bytes()
            .try_into()
            .map_err(|_| DeriveError::InvalidDerivedKey)?;
        let chain_code: [u8; 32] = ir.try_into().map_err(|_| DeriveError::InvalidDerivedKey)?;
        Ok(Self {
            network: self.network,
            depth: self.depth.saturating_add(1),
            public_key,
            chain_code,
        })
    }

    /// Legacy P2PKH address of this key.
    #[must_use]
    pub fn p2pkh(&self) -> String {
        p2pkh_address(&self.public_key, self.network)
    }
}

/// Encodes a compressed public key as a base58check P2PKH address.
#[must_use]
pub fn p2pkh_address(compressed: &[u8; 33], network: BitcoinNetwork) -> String {
    let hash = Ripemd160::digest(Sha256::digest(compressed));
    let mut payload = Vec::with_capacity(21);
    payload.push(network.p2pkh_version());
    payload.extend_from_slice(&hash);
    bs58::encode(payload).with_check().into_string()
}

/// Maps an identifier to a non-hardened child index.
///
/// Two identifiers collide with probability about 2^-31 per pair.
#[must_use]
pub fn index_for(identifier: &str) -> u32 {
    let digest = Sha256::digest(identifier.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & !HARDENED
}

/// Derives P2PKH deposit addresses along `m/0/index` of an account xpub.
#[derive(Debug, Clone)]
pub struct BitcoinDeriver {
    external: ExtendedPubKey,
}

impl BitcoinDeriver {
    /// Creates a deriver from an account-level `xpub` or `tpub`.
    ///
    /// # Errors
    ///
    /// [`DeriveError::InvalidExtendedKey`] if the key does not parse.
    pub fn new(xpub: &str) -> Result<Self, DeriveError> {
        let account: ExtendedPubKey = xpub.parse()?;
        Ok(Self {
            external: account.child(EXTERNAL_CHAIN)?,
        })
    }

    /// Network the addresses are encoded for.
    #[must_use]
    pub const fn network(&self) -> BitcoinNetwork {
        self.external.network
    }
}

impl AddressDeriver for BitcoinDeriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Bitcoin
    }

    fn derive(&self, identifier: &str) -> Result<String, DeriveError> {
        Ok(self.external.child(index_for(identifier))?.p2pkh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// BIP-32 test vector 1, chain m/0H.
    const XPUB: &str = "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw";
    /// The same key with testnet version bytes.
    const TPUB: &str = "tpubD8eQVK4Kdxg3gHrF62jGP7dKVCoYiEB8dFSpuTawkL5YxTus5j5pf83vaKnii4bc6v2NVEy81P2gYrJczYne3QNNwMTS53p5uzDyHvnw2jm";

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_bip32_vector_public_child() {
        let key: ExtendedPubKey = XPUB.parse().unwrap();
        assert_eq!(key.network(), BitcoinNetwork::Mainnet);
        let child = key.child(1).unwrap();
        assert_eq!(
            hex(child.public_key()),
            "03501e454bf00751f24b1b489aa925215d66af2234e3891c3b21a52bedb3cd711c"
        );
    }

    #[test]
    fn test_generator_point_p2pkh() {
        let mut g = [0u8; 33];
        g[0] = 0x02;
        let x = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        for (i, byte) in g[1..].iter_mut().enumerate() {
            *byte = u8::from_str_radix(&x[2 * i..2 * i + 2], 16).unwrap();
        }
        assert_eq!(
            p2pkh_address(&g, BitcoinNetwork::Mainnet),
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
    }

    #[test]
    fn test_index_is_non_hardened() {
        assert_eq!(index_for("pay_test_token"), 880_836_946);
        assert_eq!(index_for("customer-42"), 541_453_107);
        assert!(index_for("anything") < HARDENED);
    }

    #[test]
    fn test_deposit_addresses_are_deterministic() {
        let deriver = BitcoinDeriver::new(XPUB).unwrap();
        assert_eq!(
            deriver.derive("pay_test_token").unwrap(),
            "17RWF4Ce46W5EPoLCQR9v2YnrdzTycQjxK"
        );
        assert_eq!(
            deriver.derive("customer-42").unwrap(),
            "135MU24C4qf7Lm5kVXLyY2eBD116qsX2u2"
        );
        assert_eq!(
            deriver.derive("pay_test_token").unwrap(),
            BitcoinDeriver::new(XPUB).unwrap().derive("pay_test_token").unwrap()
        );

        let first = XPUB.parse::<ExtendedPubKey>().unwrap().child(0).unwrap().child(0).unwrap();
        assert_eq!(first.p2pkh(), "1BvgsfsZQVtkLS69NvGF8rw6NZW2ShJQHr");
    }

    #[test]
    fn test_testnet_key_yields_testnet_addresses() {
        let deriver = BitcoinDeriver::new(TPUB).unwrap();
        assert_eq!(deriver.network(), BitcoinNetwork::Testnet);
        assert_eq!(
            deriver.derive("pay_test_token").unwrap(),
            "mmwTY7Hcs7wL1WGwuyPXjwm7idbApsLbJ5"
        );
        assert_eq!(
            deriver.derive("customer-42").unwrap(),
            "mhbJm59Ass6N7sZND6KMMwrW4zbohbQa1x"
        );
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(BitcoinDeriver::new("xpub-not-base58!").is_err());
        let mut corrupted = XPUB.to_owned();
        corrupted.replace_range(20..21, "A");
        assert!(matches!(
            BitcoinDeriver::new(&corrupted),
            Err(DeriveError::InvalidExtendedKey(_))
        ));
        let key: ExtendedPubKey = XPUB.parse().unwrap();
        assert!(key.child(HARDENED).is_err());
    }
}
