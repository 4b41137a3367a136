//! Solana mainnet constants and the USDC deployment.

use credex::adapter::ChainProfile;
use rust_decimal::Decimal;
use solana_pubkey::{Pubkey, pubkey};

/// Associated Token Account program.
pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Native Circle USDC mint on Solana mainnet (SPL Token).
pub const USDC_SOLANA: Pubkey = pubkey!("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");

/// USDC decimals on Solana.
pub const USDC_DECIMALS: u32 = 6;

/// Slots after which a payment is reported as deep enough.
pub const REQUIRED_SLOTS: u64 = 32;

/// Default quote profile: 32 slots at roughly 400ms each.
pub const SOLANA_PROFILE: ChainProfile = ChainProfile {
    required_confirmations: REQUIRED_SLOTS,
    est_confirmation_secs: 13,
    est_fee_usd: Decimal::from_parts(1, 0, 0, false, 3),
    decimals: USDC_DECIMALS,
};

/// Returns the associated token account of `owner` for `mint`.
#[must_use]
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    let token_program = spl_token::id();
    let (ata, _) = Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_PUBKEY,
    );
    ata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_associated_token_address_depends_on_owner_and_mint() {
        let a = Pubkey::new_from_array([1; 32]);
        let b = Pubkey::new_from_array([2; 32]);
        let ata = associated_token_address(&a, &USDC_SOLANA);
        assert_eq!(ata, associated_token_address(&a, &USDC_SOLANA));
        assert_ne!(ata, associated_token_address(&b, &USDC_SOLANA));
        assert_ne!(ata, associated_token_address(&a, &spl_token::native_mint::id()));
        assert_ne!(ata, a);
    }
}
