use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{
    Beneficiary, ClaimReceipt, CreditStore, HoldOutcome, hold_entry, purchase_entry, refund_entry,
};
use crate::account::{AccountStatus, CreditAccount, CreditTransaction, LedgerEntry};
use crate::error::{CreditError, EntityKind};
use crate::escrow::{EscrowHold, HoldResolution};
use crate::payment::PaymentRequest;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<String, CreditAccount>,
    credentials: HashMap<String, String>,
    transactions: Vec<CreditTransaction>,
    payments: HashMap<String, PaymentRequest>,
    holds: HashMap<String, EscrowHold>,
    hold_order: Vec<String>,
}

impl Tables {
    fn account(&self, account_id: &str) -> Result<&CreditAccount, CreditError> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| CreditError::not_found(EntityKind::Account, account_id))
    }

    fn payment(&self, token: &str) -> Result<&PaymentRequest, CreditError> {
        self.payments
            .get(token)
            .ok_or_else(|| CreditError::not_found(EntityKind::Payment, token))
    }

    fn insert_account(&mut self, account: CreditAccount) -> Result<(), CreditError> {
        if self.accounts.contains_key(&account.id)
            || self.credentials.contains_key(&account.credential_hash)
        {
            return Err(CreditError::Storage(format!(
                "account {} already exists",
                account.id
            )));
        }
        self.credentials
            .insert(account.credential_hash.clone(), account.id.clone());
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    /// Computes the entry against a copy of the account; nothing is written
    /// until [`Tables::commit_entry`].
    fn stage_entry(
        &self,
        entry: LedgerEntry,
        at: UnixTimestamp,
    ) -> Result<(CreditAccount, CreditTransaction), CreditError> {
        let mut account = self.account(&entry.account_id)?.clone();
        let applied = account.apply(entry.amount, entry.mode)?;
        let tx = CreditTransaction::record(entry, applied, &account, at);
        Ok((account, tx))
    }

    fn commit_entry(&mut self, account: CreditAccount, tx: CreditTransaction) {
        self.accounts.insert(account.id.clone(), account);
        self.transactions.push(tx);
    }
}

/// In-process [`CreditStore`].
///
/// One mutex guards all tables, so every method is trivially atomic and
/// mutations of the same account are serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CreditStore for MemoryStore {
    async fn create_account(&self, account: CreditAccount) -> Result<(), CreditError> {
        self.tables.lock().await.insert_account(account)
    }

    async fn account(&self, account_id: &str) -> Result<Option<CreditAccount>, CreditError> {
        Ok(self.tables.lock().await.accounts.get(account_id).cloned())
    }

    async fn account_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<CreditAccount>, CreditError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .credentials
            .get(credential_hash)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<CreditAccount, CreditError> {
        let mut tables = self.tables.lock().await;
        let account = tables
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| CreditError::not_found(EntityKind::Account, account_id))?;
        account.status = status;
        Ok(account.clone())
    }

    async fn apply_entry(
        &self,
        entry: LedgerEntry,
        at: UnixTimestamp,
    ) -> Result<CreditTransaction, CreditError> {
        let mut tables = self.tables.lock().await;
        let (account, tx) = tables.stage_entry(entry, at)?;
        tables.commit_entry(account, tx.clone());
        Ok(tx)
    }

    async fn transactions(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<CreditTransaction> = tables
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let skip = rows.len().saturating_sub(limit);
            rows.drain(..skip);
        }
        Ok(rows)
    }

    async fn insert_payment(&self, payment: PaymentRequest) -> Result<(), CreditError> {
        let mut tables = self.tables.lock().await;
        if tables.payments.contains_key(&payment.payment_token) {
            return Err(CreditError::Storage(format!(
                "payment token {} already exists",
                payment.payment_token
            )));
        }
        tables
            .payments
            .insert(payment.payment_token.clone(), payment);
        Ok(())
    }

    async fn payment_by_token(&self, token: &str) -> Result<Option<PaymentRequest>, CreditError> {
        Ok(self.tables.lock().await.payments.get(token).cloned())
    }

    async fn record_confirmations(
        &self,
        token: &str,
        confirmations: u64,
    ) -> Result<(), CreditError> {
        let mut tables = self.tables.lock().await;
        let payment = tables
            .payments
            .get_mut(token)
            .ok_or_else(|| CreditError::not_found(EntityKind::Payment, token))?;
        if payment.claimed_at.is_none() {
            payment.observe_confirmations(confirmations);
        }
        Ok(())
    }

    async fn mark_confirmed(
        &self,
        token: &str,
        confirmations: u64,
        at: UnixTimestamp,
    ) -> Result<PaymentRequest, CreditError> {
        let mut tables = self.tables.lock().await;
        let payment = tables
            .payments
            .get_mut(token)
            .ok_or_else(|| CreditError::not_found(EntityKind::Payment, token))?;
        payment.confirm(confirmations, at);
        Ok(payment.clone())
    }

    async fn claim_payment(
        &self,
        token: &str,
        beneficiary: Beneficiary,
        at: UnixTimestamp,
    ) -> Result<ClaimReceipt, CreditError> {
        let mut tables = self.tables.lock().await;
        let mut payment = tables.payment(token)?.clone();
        payment.claim(beneficiary.account_id(), at)?;

        let account = match beneficiary {
            Beneficiary::Existing(id) => tables.account(&id)?.clone(),
            Beneficiary::New(account) => account,
        };
        let entry = purchase_entry(&payment, &account.id)?;
        let mut credited = account.clone();
        let applied = credited.apply(entry.amount, entry.mode)?;
        let tx = CreditTransaction::record(entry, applied, &credited, at);

        if !tables.accounts.contains_key(&account.id) {
            tables.insert_account(account)?;
        }
        tables.commit_entry(credited.clone(), tx.clone());
        tables.payments.insert(token.to_owned(), payment.clone());
        Ok(ClaimReceipt {
            payment,
            account: credited,
            transaction: tx,
        })
    }

    async fn create_hold(&self, hold: EscrowHold) -> Result<CreditTransaction, CreditError> {
        let mut tables = self.tables.lock().await;
        let entry = hold_entry(&hold)?;
        let (account, tx) = tables.stage_entry(entry, hold.created_at)?;
        tables.commit_entry(account, tx.clone());
        tables.hold_order.push(hold.id.clone());
        tables.holds.insert(hold.id.clone(), hold);
        Ok(tx)
    }

    async fn resolve_hold(
        &self,
        hold_id: &str,
        account_id: &str,
        resolution: HoldResolution,
        at: UnixTimestamp,
    ) -> Result<HoldOutcome, CreditError> {
        let mut tables = self.tables.lock().await;
        let mut hold = tables
            .holds
            .get(hold_id)
            .cloned()
            .ok_or_else(|| CreditError::not_found(EntityKind::Hold, hold_id))?;
        let refunded = hold.resolve(account_id, resolution, at)?;
        let refund = if refunded > 0 {
            let (account, tx) = tables.stage_entry(refund_entry(&hold, refunded)?, at)?;
            tables.commit_entry(account, tx.clone());
            Some(tx)
        } else {
            None
        };
        tables.holds.insert(hold.id.clone(), hold.clone());
        Ok(HoldOutcome { hold, refund })
    }

    async fn hold(&self, hold_id: &str) -> Result<Option<EscrowHold>, CreditError> {
        Ok(self.tables.lock().await.holds.get(hold_id).cloned())
    }

    async fn holds_for_account(&self, account_id: &str) -> Result<Vec<EscrowHold>, CreditError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .hold_order
            .iter()
            .filter_map(|id| tables.holds.get(id))
            .filter(|h| h.account_id == account_id)
            .cloned()
            .collect())
    }
}
