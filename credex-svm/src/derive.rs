//! ed25519 deposit owners derived from the master secret.
//!
//! `seed = HMAC-SHA256(master, "solana:" || identifier)` is used directly as
//! an ed25519 secret key. The prefix keeps the seed distinct from the EVM key
//! of the same identifier.

use credex::chain::ChainFamily;
use credex::derive::{AddressDeriver, MasterSecret};
use credex::error::DeriveError;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;

const DOMAIN: &[u8] = b"solana:";

/// [`AddressDeriver`] for Solana. The derived address is the deposit owner;
/// funds land in its USDC associated token account.
#[derive(Debug, Clone)]
pub struct SolanaDeriver {
    secret: MasterSecret,
}

impl SolanaDeriver {
    /// Creates a deriver keyed by `secret`.
    #[must_use]
    pub const fn new(secret: MasterSecret) -> Self {
        Self { secret }
    }

    /// Derives the deposit owner for `identifier`.
    #[must_use]
    pub fn owner(&self, identifier: &str) -> Pubkey {
        let mut message = Vec::with_capacity(DOMAIN.len() + identifier.len());
        message.extend_from_slice(DOMAIN);
        message.extend_from_slice(identifier.as_bytes());
        Keypair::new_from_array(self.secret.hmac_sha256(&message)).pubkey()
    }
}

impl AddressDeriver for SolanaDeriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
    }

    // Every 32-byte string is a valid ed25519 seed.
    fn derive(&self, identifier: &str) -> Result<String, DeriveError> {
        Ok(self.owner(identifier).to_string())
    }
}
