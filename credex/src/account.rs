//! Credit accounts, credentials, and ledger transaction records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CreditError;
use crate::timestamp::UnixTimestamp;

/// Whether an account may authenticate and spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Normal operation.
    Active,
    /// Credential is rejected; the balance is frozen.
    Suspended,
}

impl AccountStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(CreditError::Storage(format!("unknown account status '{other}'"))),
        }
    }
}

/// A prepaid credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditAccount {
    /// Account identifier.
    pub id: String,
    /// Current balance. Never negative.
    pub credits: u64,
    /// Account status.
    pub status: AccountStatus,
    /// SHA-256 hex digest of the API credential.
    #[serde(skip_serializing)]
    pub credential_hash: String,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

/// How a negative ledger entry treats an insufficient balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitMode {
    /// Reject the entry if the balance cannot cover it.
    Strict,
    /// Deduct `min(requested, balance)` and let the caller report the shortfall.
    Clamped,
}

impl CreditAccount {
    /// Creates an active account with a zero balance.
    #[must_use]
    pub fn open(credential: &Credential, created_at: UnixTimestamp) -> Self {
        Self {
            id: format!("acct_{}", Uuid::new_v4().simple()),
            credits: 0,
            status: AccountStatus::Active,
            credential_hash: credential.hash(),
            created_at,
        }
    }

    /// Applies a signed delta to the balance and returns the delta actually applied.
    ///
    /// # Errors
    ///
    /// - [`CreditError::InsufficientBalance`] for a strict debit larger than the balance
    /// - [`CreditError::Validation`] if a credit would overflow the balance
    pub fn apply(&mut self, delta: i64, mode: DebitMode) -> Result<i64, CreditError> {
        if delta >= 0 {
            self.credits = self
                .credits
                .checked_add(delta.unsigned_abs())
                .ok_or_else(|| CreditError::Validation("credit overflows balance".into()))?;
            return Ok(delta);
        }
        let wanted = delta.unsigned_abs();
        let taken = match mode {
            DebitMode::Strict if wanted > self.credits => {
                return Err(CreditError::InsufficientBalance {
                    required: wanted,
                    available: self.credits,
                });
            }
            DebitMode::Strict => wanted,
            DebitMode::Clamped => wanted.min(self.credits),
        };
        self.credits -= taken;
        0i64.checked_sub_unsigned(taken)
            .ok_or_else(|| CreditError::Validation("debit out of range".into()))
    }
}

/// An API credential. Only its hash is ever stored.
///
/// The plaintext is shown to the caller once, when the account is created.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Mints a fresh random credential.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!(
            "cx_{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    /// Wraps a credential presented by a caller.
    #[must_use]
    pub fn from_presented(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the SHA-256 hex digest used for storage and lookup.
    #[must_use]
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    /// Returns the plaintext credential.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&"<redacted>").finish()
    }
}

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits granted by a claimed crypto payment.
    Purchase,
    /// Credits consumed by metered usage.
    Usage,
    /// Credits moved into an escrow hold.
    EscrowHold,
    /// Credits returned from a voided escrow hold.
    EscrowRefund,
    /// Administrative correction.
    Adjustment,
}

impl TransactionType {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::EscrowHold => "escrow_hold",
            Self::EscrowRefund => "escrow_refund",
            Self::Adjustment => "adjustment",
        }
    }
}

impl FromStr for TransactionType {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "usage" => Ok(Self::Usage),
            "escrow_hold" => Ok(Self::EscrowHold),
            "escrow_refund" => Ok(Self::EscrowRefund),
            "adjustment" => Ok(Self::Adjustment),
            other => Err(CreditError::Storage(format!(
                "unknown transaction type '{other}'"
            ))),
        }
    }
}

/// A requested balance mutation, applied atomically by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Account to mutate.
    pub account_id: String,
    /// Signed credit delta.
    pub amount: i64,
    /// Transaction type recorded in the log.
    pub kind: TransactionType,
    /// Free-form description.
    pub description: String,
    /// How to treat an insufficient balance for negative amounts.
    pub mode: DebitMode,
    /// Payment that caused the entry, if any.
    pub related_payment_id: Option<String>,
    /// Escrow hold that caused the entry, if any.
    pub related_hold_id: Option<String>,
}

/// One row of the append-only credit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Transaction identifier.
    pub id: String,
    /// Account the row belongs to.
    pub account_id: String,
    /// Signed delta actually applied.
    pub amount: i64,
    /// Balance immediately after this row.
    pub balance_after: u64,
    /// Transaction type.
    pub transaction_type: TransactionType,
    /// Free-form description.
    pub description: String,
    /// Related payment request id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_payment_id: Option<String>,
    /// Related escrow hold id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_hold_id: Option<String>,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

impl CreditTransaction {
    /// Builds the log row for an entry that was applied to `account`.
    #[must_use]
    pub fn record(
        entry: LedgerEntry,
        applied: i64,
        account: &CreditAccount,
        created_at: UnixTimestamp,
    ) -> Self {
        Self {
            id: format!("txn_{}", Uuid::new_v4().simple()),
            account_id: entry.account_id,
            amount: applied,
            balance_after: account.credits,
            transaction_type: entry.kind,
            description: entry.description,
            related_payment_id: entry.related_payment_id,
            related_hold_id: entry.related_hold_id,
            created_at,
        }
    }
}

/// Checks the append-only invariant over an account's chronological history.
///
/// Every row's `balance_after` must equal the previous row's plus its `amount`
/// (starting from zero), and the final `balance_after` must equal `balance`.
#[must_use]
pub fn is_continuous(history: &[CreditTransaction], balance: u64) -> bool {
    let mut running: i128 = 0;
    for tx in history {
        running += i128::from(tx.amount);
        if running != i128::from(tx.balance_after) {
            return false;
        }
    }
    running == i128::from(balance)
}
