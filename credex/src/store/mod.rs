//! Persistence for accounts, the credit log, payment requests, and escrow holds.
//!
//! Every method of [`CreditStore`] is one atomic unit: it either applies all of
//! its effects or none of them. Check-then-set sequences (claiming a payment,
//! debiting a balance, resolving a hold) happen inside the store call, never
//! as a read followed by a separate write in the caller.
//!
//! - [`MemoryStore`] - Single-process store guarded by one async mutex
//! - [`SqliteStore`] - `rusqlite` store using `BEGIN IMMEDIATE` transactions
//!   (requires the `sqlite` feature)

use std::fmt::Debug;

use serde::Serialize;

use crate::account::{
    AccountStatus, CreditAccount, CreditTransaction, DebitMode, LedgerEntry, TransactionType,
};
use crate::error::CreditError;
use crate::escrow::{EscrowHold, HoldResolution};
use crate::payment::PaymentRequest;
use crate::timestamp::UnixTimestamp;

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Who receives the credits of a claimed payment.
#[derive(Debug, Clone)]
pub enum Beneficiary {
    /// An existing account, by id.
    Existing(String),
    /// A new account, created in the same atomic unit as the grant.
    New(CreditAccount),
}

impl Beneficiary {
    /// Returns the id of the account that will be credited.
    #[must_use]
    pub fn account_id(&self) -> &str {
        match self {
            Self::Existing(id) => id,
            Self::New(account) => &account.id,
        }
    }
}

/// The result of a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimReceipt {
    /// The payment request after the claim.
    pub payment: PaymentRequest,
    /// The credited account after the grant.
    pub account: CreditAccount,
    /// The purchase row appended to the credit log.
    pub transaction: CreditTransaction,
}

/// The result of resolving an escrow hold.
#[derive(Debug, Clone, Serialize)]
pub struct HoldOutcome {
    /// The hold after the transition.
    pub hold: EscrowHold,
    /// The refund row, when a void returned credits.
    pub refund: Option<CreditTransaction>,
}

/// Atomic persistence operations.
#[async_trait::async_trait]
pub trait CreditStore: Send + Sync + Debug {
    /// Inserts a new account.
    async fn create_account(&self, account: CreditAccount) -> Result<(), CreditError>;

    /// Looks up an account by id.
    async fn account(&self, account_id: &str) -> Result<Option<CreditAccount>, CreditError>;

    /// Looks up an account by credential hash.
    async fn account_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<CreditAccount>, CreditError>;

    /// Changes an account's status.
    async fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<CreditAccount, CreditError>;

    /// Applies a ledger entry to its account and appends the log row.
    ///
    /// The balance update and the row share one atomic unit, and
    /// `balance_after` is read from the updated balance.
    async fn apply_entry(
        &self,
        entry: LedgerEntry,
        at: UnixTimestamp,
    ) -> Result<CreditTransaction, CreditError>;

    /// Returns an account's log rows in creation order.
    ///
    /// With a limit, returns the most recent `limit` rows, still in creation order.
    async fn transactions(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CreditTransaction>, CreditError>;

    /// Persists a new payment request.
    async fn insert_payment(&self, payment: PaymentRequest) -> Result<(), CreditError>;

    /// Looks up a payment request by token.
    async fn payment_by_token(&self, token: &str) -> Result<Option<PaymentRequest>, CreditError>;

    /// Raises the recorded confirmation count of an unclaimed payment.
    async fn record_confirmations(&self, token: &str, confirmations: u64)
    -> Result<(), CreditError>;

    /// Conditionally transitions a payment from `pending` to `confirmed`.
    ///
    /// Returns the stored request; unchanged if it was no longer pending.
    async fn mark_confirmed(
        &self,
        token: &str,
        confirmations: u64,
        at: UnixTimestamp,
    ) -> Result<PaymentRequest, CreditError>;

    /// Claims a confirmed payment: stamps `claimed_at` where it is unset,
    /// creates the beneficiary if new, and credits it, all in one unit.
    async fn claim_payment(
        &self,
        token: &str,
        beneficiary: Beneficiary,
        at: UnixTimestamp,
    ) -> Result<ClaimReceipt, CreditError>;

    /// Debits the hold's credits from its account and persists it as `held`.
    async fn create_hold(&self, hold: EscrowHold) -> Result<CreditTransaction, CreditError>;

    /// Releases or voids a held hold on behalf of `account_id`.
    async fn resolve_hold(
        &self,
        hold_id: &str,
        account_id: &str,
        resolution: HoldResolution,
        at: UnixTimestamp,
    ) -> Result<HoldOutcome, CreditError>;

    /// Looks up a hold by id.
    async fn hold(&self, hold_id: &str) -> Result<Option<EscrowHold>, CreditError>;

    /// Returns all holds of an account, oldest first.
    async fn holds_for_account(&self, account_id: &str) -> Result<Vec<EscrowHold>, CreditError>;
}

fn signed(credits: u64) -> Result<i64, CreditError> {
    i64::try_from(credits)
        .map_err(|_| CreditError::Validation(format!("{credits} credits is out of range")))
}

fn purchase_entry(payment: &PaymentRequest, account_id: &str) -> Result<LedgerEntry, CreditError> {
    Ok(LedgerEntry {
        account_id: account_id.to_owned(),
        amount: signed(payment.credits_requested)?,
        kind: TransactionType::Purchase,
        description: format!(
            "Purchased {} credits with {}",
            payment.credits_requested, payment.chain
        ),
        mode: DebitMode::Strict,
        related_payment_id: Some(payment.id.clone()),
        related_hold_id: None,
    })
}

fn hold_entry(hold: &EscrowHold) -> Result<LedgerEntry, CreditError> {
    Ok(LedgerEntry {
        account_id: hold.account_id.clone(),
        amount: -signed(hold.credits_held)?,
        kind: TransactionType::EscrowHold,
        description: format!("Escrow hold for {} ({})", hold.reference, hold.service),
        mode: DebitMode::Strict,
        related_payment_id: None,
        related_hold_id: Some(hold.id.clone()),
    })
}

fn refund_entry(hold: &EscrowHold, refunded: u64) -> Result<LedgerEntry, CreditError> {
    Ok(LedgerEntry {
        account_id: hold.account_id.clone(),
        amount: signed(refunded)?,
        kind: TransactionType::EscrowRefund,
        description: format!("Escrow refund for {} ({})", hold.reference, hold.service),
        mode: DebitMode::Strict,
        related_payment_id: None,
        related_hold_id: Some(hold.id.clone()),
    })
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behavior every [`CreditStore`] must share, run against each backend.

    use std::sync::Arc;

    use rust_decimal::Decimal;

    use super::*;
    use crate::account::{Credential, is_continuous};
    use crate::error::EntityKind;
    use crate::escrow::HoldStatus;
    use crate::payment::PaymentState;
    use crate::payment::tests::pending_payment;

    fn ts(secs: u64) -> UnixTimestamp {
        UnixTimestamp::from_secs(secs)
    }

    fn entry(account_id: &str, amount: i64, mode: DebitMode) -> LedgerEntry {
        LedgerEntry {
            account_id: account_id.to_owned(),
            amount,
            kind: TransactionType::Adjustment,
            description: "test".into(),
            mode,
            related_payment_id: None,
            related_hold_id: None,
        }
    }

    async fn funded(store: &dyn CreditStore, credits: i64) -> CreditAccount {
        let account = CreditAccount::open(&Credential::generate(), ts(0));
        store.create_account(account.clone()).await.unwrap();
        if credits > 0 {
            store
                .apply_entry(entry(&account.id, credits, DebitMode::Strict), ts(1))
                .await
                .unwrap();
        }
        store.account(&account.id).await.unwrap().unwrap()
    }

    pub(crate) async fn ledger_roundtrip(store: Arc<dyn CreditStore>) {
        let account = funded(store.as_ref(), 100).await;
        let tx = store
            .apply_entry(entry(&account.id, -30, DebitMode::Strict), ts(2))
            .await
            .unwrap();
        assert_eq!(tx.balance_after, 70);
        assert_eq!(tx.amount, -30);

        let err = store
            .apply_entry(entry(&account.id, -80, DebitMode::Strict), ts(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreditError::InsufficientBalance {
                required: 80,
                available: 70
            }
        ));

        let clamped = store
            .apply_entry(entry(&account.id, -80, DebitMode::Clamped), ts(4))
            .await
            .unwrap();
        assert_eq!(clamped.amount, -70);
        assert_eq!(clamped.balance_after, 0);

        let history = store.transactions(&account.id, None).await.unwrap();
        assert_eq!(history.len(), 3);
        let balance = store.account(&account.id).await.unwrap().unwrap().credits;
        assert!(is_continuous(&history, balance));

        let recent = store.transactions(&account.id, Some(2)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, clamped.id);

        let by_cred = store
            .account_by_credential(&account.credential_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_cred.id, account.id);

        let err = store
            .apply_entry(entry("acct_missing", 5, DebitMode::Strict), ts(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::NotFound { kind: EntityKind::Account, .. }));
    }

    pub(crate) async fn claim_exactly_once(store: Arc<dyn CreditStore>) {
        let payment = pending_payment();
        let token = payment.payment_token.clone();
        store.insert_payment(payment.clone()).await.unwrap();

        let owner = funded(store.as_ref(), 0).await;
        let err = store
            .claim_payment(&token, Beneficiary::Existing(owner.id.clone()), ts(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::Conflict { ref status, .. } if status == "pending"));

        store.record_confirmations(&token, 10).await.unwrap();
        let confirmed = store.mark_confirmed(&token, 64, ts(3)).await.unwrap();
        assert_eq!(confirmed.status, PaymentState::Confirmed);
        assert_eq!(confirmed.confirmations_seen, 64);
        // Second transition is a no-op.
        let again = store.mark_confirmed(&token, 70, ts(4)).await.unwrap();
        assert_eq!(again.confirmed_at, Some(ts(3)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let token = token.clone();
            let beneficiary = Beneficiary::New(CreditAccount::open(&Credential::generate(), ts(5)));
            handles.push(tokio::spawn(async move {
                store.claim_payment(&token, beneficiary, ts(5)).await
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(receipt) => winners.push(receipt),
                Err(err) => assert!(
                    matches!(err, CreditError::Conflict { ref status, .. } if status == "claimed"),
                    "{err}"
                ),
            }
        }
        assert_eq!(winners.len(), 1);
        let receipt = &winners[0];
        assert_eq!(receipt.account.credits, payment.credits_requested);
        assert_eq!(receipt.transaction.transaction_type, TransactionType::Purchase);
        assert_eq!(
            receipt.transaction.related_payment_id.as_deref(),
            Some(payment.id.as_str())
        );

        let stored = store.payment_by_token(&token).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentState::Claimed);
        assert_eq!(stored.account_id.as_deref(), Some(receipt.account.id.as_str()));

        // Losing claimers never got an account.
        let credited = store.account(&receipt.account.id).await.unwrap().unwrap();
        assert_eq!(credited.credits, payment.credits_requested);
        assert!(store.account(&owner.id).await.unwrap().unwrap().credits == 0);
    }

    pub(crate) async fn escrow_lifecycle(store: Arc<dyn CreditStore>) {
        let account = funded(store.as_ref(), 100).await;
        let hold = EscrowHold::new(
            &account.id,
            Decimal::from(8),
            80,
            "job-7".into(),
            "market".into(),
            ts(2),
        );
        let hold_id = hold.id.clone();
        let debit = store.create_hold(hold).await.unwrap();
        assert_eq!(debit.amount, -80);
        assert_eq!(debit.balance_after, 20);
        assert_eq!(debit.related_hold_id.as_deref(), Some(hold_id.as_str()));

        let too_big = EscrowHold::new(
            &account.id,
            Decimal::from(5),
            50,
            "job-8".into(),
            "market".into(),
            ts(3),
        );
        let err = store.create_hold(too_big.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            CreditError::InsufficientBalance {
                required: 50,
                available: 20
            }
        ));
        assert!(store.hold(&too_big.id).await.unwrap().is_none());

        let err = store
            .resolve_hold(&hold_id, "acct_intruder", HoldResolution::Release, ts(4))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::Unauthorized(_)));

        let outcome = store
            .resolve_hold(
                &hold_id,
                &account.id,
                HoldResolution::Void { refund_percent: 50 },
                ts(5),
            )
            .await
            .unwrap();
        assert_eq!(outcome.hold.status, HoldStatus::Voided);
        assert_eq!(outcome.hold.refunded_credits, Some(40));
        assert_eq!(outcome.refund.as_ref().map(|t| t.amount), Some(40));
        assert_eq!(store.account(&account.id).await.unwrap().unwrap().credits, 60);

        let err = store
            .resolve_hold(&hold_id, &account.id, HoldResolution::Release, ts(6))
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::Conflict { ref status, .. } if status == "voided"));

        let holds = store.holds_for_account(&account.id).await.unwrap();
        assert_eq!(holds.len(), 1);

        let history = store.transactions(&account.id, None).await.unwrap();
        assert!(is_continuous(&history, 60));
    }

    pub(crate) async fn concurrent_holds_never_overdraw(store: Arc<dyn CreditStore>) {
        let account = funded(store.as_ref(), 100).await;
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            let hold = EscrowHold::new(
                &account.id,
                Decimal::from(3),
                30,
                format!("job-{i}"),
                "market".into(),
                ts(2),
            );
            handles.push(tokio::spawn(async move { store.create_hold(hold).await }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 3);
        let balance = store.account(&account.id).await.unwrap().unwrap().credits;
        assert_eq!(balance, 10);
        let history = store.transactions(&account.id, None).await.unwrap();
        assert!(is_continuous(&history, balance));
    }
}
