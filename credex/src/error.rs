//! Error types for credit purchase, ledger, and escrow operations.
//!
//! [`CreditError`] is the single domain error surfaced to callers. Lower layers
//! ([`ChainError`] from chain adapters, [`DeriveError`] from address derivation)
//! convert into it with `From`.

use std::fmt;

use serde::Serialize;

/// The kind of record an operation referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A payment request, looked up by its payment token.
    Payment,
    /// A credit account.
    Account,
    /// An escrow hold.
    Hold,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Payment => "payment",
            Self::Account => "account",
            Self::Hold => "escrow hold",
        })
    }
}

/// Errors returned by the credits subsystem.
///
/// Every variant is request-scoped. A failed operation never leaves a partial
/// ledger mutation behind.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// Malformed input: unknown chain, unlisted tier, non-positive amount.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown or suspended credential, or a record owned by another account.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: EntityKind,
        /// The identifier that was looked up.
        id: String,
    },

    /// The record is not in a state that permits the operation.
    #[error("{kind} is {status}")]
    Conflict {
        /// The record kind.
        kind: EntityKind,
        /// The current status of the record.
        status: String,
    },

    /// A strict debit or hold would take the balance below zero.
    #[error("insufficient balance: {required} credits required, {available} available")]
    InsufficientBalance {
        /// Credits the operation needs.
        required: u64,
        /// Credits currently on the account.
        available: u64,
    },

    /// A chain data or price provider failed; retry later.
    #[error("verification unavailable: {0}")]
    ProviderUnavailable(String),

    /// Misconfiguration detected at runtime (bad secret, missing adapter).
    #[error("configuration error: {0}")]
    Config(String),

    /// The storage backend failed; the atomic unit was rolled back.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CreditError {
    /// Creates a [`CreditError::NotFound`] for the given record.
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a [`CreditError::Conflict`] naming the current status.
    pub fn conflict(kind: EntityKind, status: impl fmt::Display) -> Self {
        Self::Conflict {
            kind,
            status: status.to_string(),
        }
    }

    /// Returns `true` for errors a caller should retry later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }
}

/// Errors raised by chain adapters while talking to providers.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The provider call failed (transport, RPC error, bad status code).
    #[error("{chain} provider error: {message}")]
    Provider {
        /// Chain name used for context.
        chain: &'static str,
        /// Human-readable description of the failure.
        message: String,
    },

    /// The provider answered with data that could not be interpreted.
    #[error("{chain} provider returned malformed data: {message}")]
    Malformed {
        /// Chain name used for context.
        chain: &'static str,
        /// Human-readable description of the failure.
        message: String,
    },

    /// The provider call did not complete within the configured timeout.
    #[error("{chain} provider timed out")]
    Timeout {
        /// Chain name used for context.
        chain: &'static str,
    },

    /// The deposit address could not be parsed for this chain.
    #[error("invalid {chain} address: {address}")]
    InvalidAddress {
        /// Chain name used for context.
        chain: &'static str,
        /// The offending address.
        address: String,
    },
}

impl ChainError {
    /// Creates a [`ChainError::Provider`] from any displayable error.
    pub fn provider(chain: &'static str, err: impl fmt::Display) -> Self {
        Self::Provider {
            chain,
            message: err.to_string(),
        }
    }

    /// Creates a [`ChainError::Malformed`] from any displayable error.
    pub fn malformed(chain: &'static str, err: impl fmt::Display) -> Self {
        Self::Malformed {
            chain,
            message: err.to_string(),
        }
    }
}

impl From<ChainError> for CreditError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::InvalidAddress { .. } => Self::Config(err.to_string()),
            _ => Self::ProviderUnavailable(err.to_string()),
        }
    }
}

/// Errors raised while deriving deposit addresses.
///
/// These are programming-time invariants: they are never retried.
#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    /// The master secret is missing or too short.
    #[error("master secret must be at least {min} bytes, got {actual}")]
    SecretTooShort {
        /// Minimum accepted length.
        min: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// No deriver is registered for the chain family.
    #[error("no address deriver registered for the {0} family")]
    UnsupportedFamily(crate::chain::ChainFamily),

    /// The configured extended public key is malformed.
    #[error("invalid extended public key: {0}")]
    InvalidExtendedKey(String),

    /// The derived key material is not a valid key (probability ~2^-127).
    #[error("derived key is out of range for identifier")]
    InvalidDerivedKey,
}

impl From<DeriveError> for CreditError {
    fn from(err: DeriveError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CreditError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_names_status() {
        let err = CreditError::conflict(EntityKind::Hold, "voided");
        assert_eq!(err.to_string(), "escrow hold is voided");
    }

    #[test]
    fn test_insufficient_balance_message() {
        let err = CreditError::InsufficientBalance {
            required: 50,
            available: 40,
        };
        assert_eq!(
            err.to_string(),
            "insufficient balance: 50 credits required, 40 available"
        );
    }

    #[test]
    fn test_provider_errors_are_transient() {
        let err: CreditError = ChainError::Timeout { chain: "polygon" }.into();
        assert!(err.is_transient());
        let err: CreditError = DeriveError::InvalidDerivedKey.into();
        assert!(!err.is_transient());
    }
}
