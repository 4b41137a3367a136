//! Escrow holds placed by a marketplace against an account's credits.
//!
//! Credits leave the account when a hold is created. Releasing a hold commits
//! them (no balance change); voiding a hold refunds some or all of them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::account::CreditTransaction;
use crate::amount::credits_for_usd;
use crate::error::{CreditError, EntityKind};
use crate::store::{CreditStore, HoldOutcome};
use crate::timestamp::UnixTimestamp;

/// State of an escrow hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    /// Credits are reserved.
    Held,
    /// Credits were committed to the work. Terminal.
    Released,
    /// Credits were (partially) refunded. Terminal.
    Voided,
}

impl HoldStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Released => "released",
            Self::Voided => "voided",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldStatus {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(Self::Held),
            "released" => Ok(Self::Released),
            "voided" => Ok(Self::Voided),
            other => Err(CreditError::Storage(format!("unknown hold status '{other}'"))),
        }
    }
}

/// How a held hold is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldResolution {
    /// Commit the credits; no refund.
    Release,
    /// Refund `floor(credits_held * refund_percent / 100)` credits.
    Void {
        /// Percentage to refund, `0..=100`.
        refund_percent: u8,
    },
}

/// A reservation of credits for a marketplace job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    /// Hold identifier.
    pub id: String,
    /// Paying account.
    pub account_id: String,
    /// USD amount requested by the marketplace.
    pub amount_usd: Decimal,
    /// Credits debited at creation, `ceil(amount_usd * 10)`.
    pub credits_held: u64,
    /// Opaque marketplace reference.
    pub reference: String,
    /// Opaque marketplace service name.
    pub service: String,
    /// Current state.
    pub status: HoldStatus,
    /// Refund percentage, set only on void.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_percent: Option<u8>,
    /// Credits refunded, set only on void.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_credits: Option<u64>,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Release time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<UnixTimestamp>,
    /// Void time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<UnixTimestamp>,
}

impl EscrowHold {
    /// Creates a new hold in the `held` state.
    #[must_use]
    pub fn new(
        account_id: &str,
        amount_usd: Decimal,
        credits_held: u64,
        reference: String,
        service: String,
        created_at: UnixTimestamp,
    ) -> Self {
        Self {
            id: format!("hold_{}", Uuid::new_v4().simple()),
            account_id: account_id.to_owned(),
            amount_usd,
            credits_held,
            reference,
            service,
            status: HoldStatus::Held,
            refund_percent: None,
            refunded_credits: None,
            created_at,
            released_at: None,
            voided_at: None,
        }
    }

    /// Applies a resolution on behalf of `account_id`.
    ///
    /// Returns the number of credits to refund (zero for a release). The hold
    /// is left untouched on error.
    ///
    /// # Errors
    ///
    /// - [`CreditError::Unauthorized`] if the hold belongs to another account
    /// - [`CreditError::Validation`] if the refund percentage exceeds 100
    /// - [`CreditError::Conflict`] naming the status if the hold is not `held`
    pub fn resolve(
        &mut self,
        account_id: &str,
        resolution: HoldResolution,
        at: UnixTimestamp,
    ) -> Result<u64, CreditError> {
        if self.account_id != account_id {
            return Err(CreditError::Unauthorized(
                "escrow hold belongs to a different account".into(),
            ));
        }
        if let HoldResolution::Void { refund_percent } = resolution
            && refund_percent > 100
        {
            return Err(CreditError::Validation(format!(
                "refund_percent must be between 0 and 100, got {refund_percent}"
            )));
        }
        if self.status != HoldStatus::Held {
            return Err(CreditError::conflict(EntityKind::Hold, self.status));
        }
        match resolution {
            HoldResolution::Release => {
                self.status = HoldStatus::Released;
                self.released_at = Some(at);
                Ok(0)
            }
            HoldResolution::Void { refund_percent } => {
                let refunded = refund_for(self.credits_held, refund_percent);
                self.status = HoldStatus::Voided;
                self.refund_percent = Some(refund_percent);
                self.refunded_credits = Some(refunded);
                self.voided_at = Some(at);
                Ok(refunded)
            }
        }
    }
}

/// `floor(credits_held * refund_percent / 100)`, never more than `credits_held`.
#[must_use]
pub fn refund_for(credits_held: u64, refund_percent: u8) -> u64 {
    let refunded = u128::from(credits_held) * u128::from(refund_percent.min(100)) / 100;
    // refunded <= credits_held, so the conversion cannot fail.
    u64::try_from(refunded).unwrap_or(credits_held)
}

/// The result of placing a hold.
#[derive(Debug, Clone, Serialize)]
pub struct HoldReceipt {
    /// The new hold.
    pub hold: EscrowHold,
    /// The debit row.
    pub transaction: CreditTransaction,
}

/// Escrow operations on top of a [`CreditStore`].
#[derive(Debug, Clone)]
pub struct EscrowLedger {
    store: Arc<dyn CreditStore>,
}

impl EscrowLedger {
    /// Default refund percentage for [`EscrowLedger::void`].
    pub const FULL_REFUND: u8 = 100;

    /// Creates an escrow ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Places a hold of `ceil(amount_usd * 10)` credits.
    ///
    /// # Errors
    ///
    /// - [`CreditError::Validation`] for a non-positive amount
    /// - [`CreditError::InsufficientBalance`] reporting required and available credits
    /// - [`CreditError::NotFound`] for an unknown account
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn hold(
        &self,
        account_id: &str,
        amount_usd: Decimal,
        reference: &str,
        service: &str,
    ) -> Result<HoldReceipt, CreditError> {
        let credits = credits_for_usd(amount_usd)?;
        let hold = EscrowHold::new(
            account_id,
            amount_usd,
            credits,
            reference.to_owned(),
            service.to_owned(),
            UnixTimestamp::now(),
        );
        let transaction = self.store.create_hold(hold.clone()).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(hold_id = %hold.id, credits, "escrow hold placed");
        Ok(HoldReceipt { hold, transaction })
    }

    /// Releases a held hold. The balance does not change.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`], [`CreditError::Unauthorized`], or
    /// [`CreditError::Conflict`] naming the current status.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn release(&self, hold_id: &str, account_id: &str) -> Result<HoldOutcome, CreditError> {
        self.store
            .resolve_hold(hold_id, account_id, HoldResolution::Release, UnixTimestamp::now())
            .await
    }

    /// Voids a held hold, refunding `refund_percent` (default 100) of it.
    ///
    /// # Errors
    ///
    /// [`CreditError::Validation`] for a percentage above 100, plus the errors
    /// of [`EscrowLedger::release`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn void(
        &self,
        hold_id: &str,
        account_id: &str,
        refund_percent: Option<u8>,
    ) -> Result<HoldOutcome, CreditError> {
        let refund_percent = refund_percent.unwrap_or(Self::FULL_REFUND);
        self.store
            .resolve_hold(
                hold_id,
                account_id,
                HoldResolution::Void { refund_percent },
                UnixTimestamp::now(),
            )
            .await
    }

    /// Returns a hold owned by `account_id`.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] if missing, [`CreditError::Unauthorized`] if
    /// owned by another account.
    pub async fn get(&self, hold_id: &str, account_id: &str) -> Result<EscrowHold, CreditError> {
        let hold = self
            .store
            .hold(hold_id)
            .await?
            .ok_or_else(|| CreditError::not_found(EntityKind::Hold, hold_id))?;
        if hold.account_id != account_id {
            return Err(CreditError::Unauthorized(
                "escrow hold belongs to a different account".into(),
            ));
        }
        Ok(hold)
    }

    /// Lists an account's holds, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn list(&self, account_id: &str) -> Result<Vec<EscrowHold>, CreditError> {
        self.store.holds_for_account(account_id).await
    }
}
