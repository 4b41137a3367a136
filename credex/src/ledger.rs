//! Credit balance operations.
//!
//! [`CreditLedger`] is the only way balances change outside of claims and
//! escrow. Every call is a single [`CreditStore`] operation, so the balance
//! update and its log row are written together or not at all.

use std::sync::Arc;

use serde::Serialize;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::account::{
    AccountStatus, Credential, CreditAccount, CreditTransaction, DebitMode, LedgerEntry,
    TransactionType, is_continuous,
};
use crate::error::{CreditError, EntityKind};
use crate::store::CreditStore;
use crate::timestamp::UnixTimestamp;

/// The record a ledger entry refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    /// A payment request id.
    Payment(String),
    /// An escrow hold id.
    Hold(String),
}

/// Outcome of [`CreditLedger::debit_clamped`].
#[derive(Debug, Clone, Serialize)]
pub struct ClampedDebit {
    /// Credits actually deducted.
    pub deducted: u64,
    /// Credits requested but not available.
    pub shortfall: u64,
    /// The log row. Written even when nothing could be deducted.
    pub transaction: CreditTransaction,
}

/// Balance mutations and account lookups over a [`CreditStore`].
#[derive(Debug, Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
}

fn positive(amount: u64) -> Result<i64, CreditError> {
    if amount == 0 {
        return Err(CreditError::Validation("amount must be positive".into()));
    }
    i64::try_from(amount)
        .map_err(|_| CreditError::Validation(format!("amount {amount} is out of range")))
}

fn entry(
    account_id: &str,
    amount: i64,
    kind: TransactionType,
    description: &str,
    mode: DebitMode,
    related: Option<Related>,
) -> LedgerEntry {
    let (related_payment_id, related_hold_id) = match related {
        Some(Related::Payment(id)) => (Some(id), None),
        Some(Related::Hold(id)) => (None, Some(id)),
        None => (None, None),
    };
    LedgerEntry {
        account_id: account_id.to_owned(),
        amount,
        kind,
        description: description.to_owned(),
        mode,
        related_payment_id,
        related_hold_id,
    }
}

impl CreditLedger {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Opens an empty account and returns it with its freshly minted credential.
    ///
    /// The plaintext credential is not stored anywhere.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn open_account(&self) -> Result<(CreditAccount, Credential), CreditError> {
        let credential = Credential::generate();
        let account = CreditAccount::open(&credential, UnixTimestamp::now());
        self.store.create_account(account.clone()).await?;
        Ok((account, credential))
    }

    /// Resolves a presented credential to its active account.
    ///
    /// # Errors
    ///
    /// [`CreditError::Unauthorized`] for unknown credentials and suspended accounts.
    pub async fn authenticate(&self, credential: &Credential) -> Result<CreditAccount, CreditError> {
        let account = self
            .store
            .account_by_credential(&credential.hash())
            .await?
            .ok_or_else(|| CreditError::Unauthorized("invalid credential".into()))?;
        match account.status {
            AccountStatus::Active => Ok(account),
            AccountStatus::Suspended => {
                Err(CreditError::Unauthorized("account is suspended".into()))
            }
        }
    }

    /// Returns an account by id.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if the account does not exist.
    pub async fn account(&self, account_id: &str) -> Result<CreditAccount, CreditError> {
        self.store
            .account(account_id)
            .await?
            .ok_or_else(|| CreditError::not_found(EntityKind::Account, account_id))
    }

    /// Returns an account's current balance.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if the account does not exist.
    pub async fn balance(&self, account_id: &str) -> Result<u64, CreditError> {
        Ok(self.account(account_id).await?.credits)
    }

    /// Adds credits to an account.
    ///
    /// # Errors
    ///
    /// [`CreditError::Validation`] for a zero amount, [`CreditError::NotFound`]
    /// for an unknown account.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, description), err))]
    pub async fn credit(
        &self,
        account_id: &str,
        amount: u64,
        kind: TransactionType,
        description: &str,
        related: Option<Related>,
    ) -> Result<CreditTransaction, CreditError> {
        let amount = positive(amount)?;
        let e = entry(account_id, amount, kind, description, DebitMode::Strict, related);
        self.store.apply_entry(e, UnixTimestamp::now()).await
    }

    /// Removes credits, refusing to go below zero.
    ///
    /// # Errors
    ///
    /// [`CreditError::InsufficientBalance`] with the required and available
    /// credits, plus the errors of [`CreditLedger::credit`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self, description), err))]
    pub async fn debit(
        &self,
        account_id: &str,
        amount: u64,
        kind: TransactionType,
        description: &str,
        related: Option<Related>,
    ) -> Result<CreditTransaction, CreditError> {
        let amount = positive(amount)?;
        let e = entry(account_id, -amount, kind, description, DebitMode::Strict, related);
        self.store.apply_entry(e, UnixTimestamp::now()).await
    }

    /// Removes `min(amount, balance)` credits and reports the shortfall.
    ///
    /// # Errors
    ///
    /// The errors of [`CreditLedger::credit`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self, description), err))]
    pub async fn debit_clamped(
        &self,
        account_id: &str,
        amount: u64,
        kind: TransactionType,
        description: &str,
        related: Option<Related>,
    ) -> Result<ClampedDebit, CreditError> {
        let requested = positive(amount)?;
        let e = entry(account_id, -requested, kind, description, DebitMode::Clamped, related);
        let transaction = self.store.apply_entry(e, UnixTimestamp::now()).await?;
        let deducted = transaction.amount.unsigned_abs();
        Ok(ClampedDebit {
            deducted,
            shortfall: amount - deducted,
            transaction,
        })
    }

    /// Applies a signed administrative adjustment.
    ///
    /// Negative deltas follow strict debit rules.
    ///
    /// # Errors
    ///
    /// The errors of [`CreditLedger::debit`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self, description), err))]
    pub async fn adjust(
        &self,
        account_id: &str,
        delta: i64,
        description: &str,
    ) -> Result<CreditTransaction, CreditError> {
        if delta == 0 {
            return Err(CreditError::Validation("adjustment must be non-zero".into()));
        }
        let e = entry(
            account_id,
            delta,
            TransactionType::Adjustment,
            description,
            DebitMode::Strict,
            None,
        );
        self.store.apply_entry(e, UnixTimestamp::now()).await
    }

    /// Returns the account's log, oldest first, optionally only the last `limit` rows.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if the account does not exist.
    pub async fn history(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        self.account(account_id).await?;
        self.store.transactions(account_id, limit).await
    }

    /// Suspends or reactivates an account.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if the account does not exist.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn set_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<CreditAccount, CreditError> {
        self.store.set_account_status(account_id, status).await
    }

    /// Replays the account's full history and checks it against the balance.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if the account does not exist.
    pub async fn verify_continuity(&self, account_id: &str) -> Result<bool, CreditError> {
        let account = self.account(account_id).await?;
        let history = self.store.transactions(account_id, None).await?;
        Ok(is_continuous(&history, account.credits))
    }
}
