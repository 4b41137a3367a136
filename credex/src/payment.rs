//! Payment requests: the persisted record of a purchase intent.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::Chain;
use crate::error::{CreditError, EntityKind};
use crate::timestamp::UnixTimestamp;

/// Lifecycle state of a payment request.
///
/// Transitions only `pending → confirmed → claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Waiting for sufficient confirmed funds.
    Pending,
    /// Funds confirmed on chain; credits not yet granted.
    Confirmed,
    /// Credits granted. Terminal.
    Claimed,
}

impl PaymentState {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Claimed => "claimed",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "claimed" => Ok(Self::Claimed),
            other => Err(CreditError::Storage(format!("unknown payment state '{other}'"))),
        }
    }
}

/// A purchase intent and its settlement progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Internal identifier, referenced by ledger rows.
    pub id: String,
    /// Caller-facing correlation token; also the derivation identifier.
    pub payment_token: String,
    /// Account the purchase is bound to, if any.
    pub account_id: Option<String>,
    /// Chain the payment is made on.
    pub chain: Chain,
    /// Derived deposit address.
    pub deposit_address: String,
    /// Credits granted on claim.
    pub credits_requested: u64,
    /// USD price of the tier.
    pub usd_amount: Decimal,
    /// Amount due, in the chain's smallest unit, fixed at quote time.
    pub required_amount: u64,
    /// Lifecycle state.
    pub status: PaymentState,
    /// Highest confirmation count observed so far.
    pub confirmations_seen: u64,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// When the payment was confirmed.
    pub confirmed_at: Option<UnixTimestamp>,
    /// When credits were granted. Set at most once.
    pub claimed_at: Option<UnixTimestamp>,
}

/// Generates a fresh payment token.
#[must_use]
pub fn new_payment_token() -> String {
    format!("pay_{}", Uuid::new_v4().simple())
}

impl PaymentRequest {
    /// Records a confirmation count, keeping the highest seen.
    pub fn observe_confirmations(&mut self, confirmations: u64) {
        self.confirmations_seen = self.confirmations_seen.max(confirmations);
    }

    /// Transitions `pending → confirmed`.
    ///
    /// Returns `false` without changes if the request is not pending.
    pub fn confirm(&mut self, confirmations: u64, at: UnixTimestamp) -> bool {
        if self.status != PaymentState::Pending {
            return false;
        }
        self.observe_confirmations(confirmations);
        self.status = PaymentState::Confirmed;
        self.confirmed_at = Some(at);
        true
    }

    /// Transitions `confirmed → claimed`, binding the request to `account_id`.
    ///
    /// # Errors
    ///
    /// - [`CreditError::Conflict`] if already claimed or still pending
    /// - [`CreditError::Unauthorized`] if bound to a different account
    pub fn claim(&mut self, account_id: &str, at: UnixTimestamp) -> Result<(), CreditError> {
        if self.claimed_at.is_some() || self.status == PaymentState::Claimed {
            return Err(CreditError::conflict(EntityKind::Payment, PaymentState::Claimed));
        }
        if self.status != PaymentState::Confirmed {
            return Err(CreditError::conflict(EntityKind::Payment, self.status));
        }
        if let Some(bound) = &self.account_id
            && bound != account_id
        {
            return Err(CreditError::Unauthorized(
                "payment is bound to a different account".into(),
            ));
        }
        self.account_id = Some(account_id.to_owned());
        self.status = PaymentState::Claimed;
        self.claimed_at = Some(at);
        Ok(())
    }
}
