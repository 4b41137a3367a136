//! Crypto purchase settlement: quote, verify, claim.
//!
//! A payment request moves `pending → confirmed → claimed`. Transitions of one
//! payment token are serialized by a keyed lock, and the store's conditional
//! updates are the final guard, so a payment credits exactly one account once.
//!
//! Provider failures never change state. They surface as
//! [`Verification::Unavailable`] on polls and as
//! [`CreditError::ProviderUnavailable`] on claims.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::account::{Credential, CreditAccount, CreditTransaction};
use crate::adapter::{AdapterRegistry, ChainAdapter, DepositTarget, PaymentStatus, Quote};
use crate::cache::KeyedLocks;
use crate::chain::Chain;
use crate::derive::KeyDerivationEngine;
use crate::error::{ChainError, CreditError, EntityKind};
use crate::ledger::CreditLedger;
use crate::payment::{PaymentRequest, PaymentState, new_payment_token};
use crate::store::{Beneficiary, CreditStore};
use crate::tier::{TIERS, Tier};
use crate::timestamp::UnixTimestamp;

/// Who a claim credits.
#[derive(Debug, Clone)]
pub enum ClaimTarget {
    /// The account owning this credential.
    Existing(Credential),
    /// A new account, created by the claim.
    NewAccount,
}

/// Where the status in a [`PaymentView`] came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Verification {
    /// The chain was queried for this response.
    Live,
    /// The stored state was returned without a chain query.
    Cached,
    /// The chain query failed; the stored state is returned unchanged.
    Unavailable {
        /// Why verification failed.
        reason: String,
    },
}

/// A payment request as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    /// Payment token.
    pub payment_token: String,
    /// Chain to pay on.
    pub chain: Chain,
    /// Deposit address.
    pub deposit_address: String,
    /// Credits granted on claim.
    pub credits_requested: u64,
    /// Amount due, in smallest units.
    pub required_amount: u64,
    /// Lifecycle state after this poll.
    pub status: PaymentState,
    /// Highest confirmation count recorded.
    pub confirmations_seen: u64,
    /// Confirmation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<UnixTimestamp>,
    /// Claim time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<UnixTimestamp>,
    /// Source of the status.
    pub verification: Verification,
    /// The adapter's report, when the chain was queried successfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_status: Option<PaymentStatus>,
}

impl PaymentView {
    fn new(
        payment: PaymentRequest,
        verification: Verification,
        chain_status: Option<PaymentStatus>,
    ) -> Self {
        Self {
            payment_token: payment.payment_token,
            chain: payment.chain,
            deposit_address: payment.deposit_address,
            credits_requested: payment.credits_requested,
            required_amount: payment.required_amount,
            status: payment.status,
            confirmations_seen: payment.confirmations_seen,
            confirmed_at: payment.confirmed_at,
            claimed_at: payment.claimed_at,
            verification,
            chain_status,
        }
    }
}

/// The result of a successful claim.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResult {
    /// The claimed payment token.
    pub payment_token: String,
    /// The credited account.
    pub account_id: String,
    /// Credits added by the claim.
    pub credits_added: u64,
    /// Balance after the claim.
    pub balance: u64,
    /// The purchase row.
    pub transaction: CreditTransaction,
    /// Plaintext credential of a newly created account. Shown only here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Orchestrates quotes, verification, and claims.
#[derive(Debug, Clone)]
pub struct SettlementService {
    store: Arc<dyn CreditStore>,
    ledger: CreditLedger,
    adapters: AdapterRegistry,
    deriver: KeyDerivationEngine,
    locks: KeyedLocks,
    provider_timeout: Duration,
}

impl SettlementService {
    /// Default bound on a single provider call.
    pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a service over the given store, adapters, and derivers.
    #[must_use]
    pub fn new(
        store: Arc<dyn CreditStore>,
        adapters: AdapterRegistry,
        deriver: KeyDerivationEngine,
    ) -> Self {
        Self {
            ledger: CreditLedger::new(Arc::clone(&store)),
            store,
            adapters,
            deriver,
            locks: KeyedLocks::new(),
            provider_timeout: Self::DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// Overrides the provider call timeout.
    #[must_use]
    pub const fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// The purchasable tiers.
    #[must_use]
    pub const fn tiers(&self) -> &'static [Tier] {
        &TIERS
    }

    /// Chains with a configured adapter.
    #[must_use]
    pub fn chains(&self) -> Vec<Chain> {
        self.adapters.chains()
    }

    /// Starts a purchase: derives a deposit address, quotes it, and persists a
    /// pending payment request.
    ///
    /// # Errors
    ///
    /// - [`CreditError::Validation`] for an unlisted tier or unsupported chain
    /// - [`CreditError::Config`] if the chain family cannot derive addresses
    /// - [`CreditError::ProviderUnavailable`] if pricing fails
    #[cfg_attr(feature = "telemetry", instrument(skip(self, account), err))]
    pub async fn initiate(
        &self,
        credits: u64,
        chain: Chain,
        account: Option<&CreditAccount>,
    ) -> Result<Quote, CreditError> {
        let tier = Tier::for_credits(credits)?;
        let adapter = self.adapters.get(chain)?;
        let payment_token = new_payment_token();
        let deposit_address = self.deriver.derive(&payment_token, chain.family())?;
        let target = DepositTarget {
            payment_token: payment_token.clone(),
            deposit_address: deposit_address.clone(),
        };
        let quote = self
            .bounded(chain, adapter.quote(&tier, target))
            .await?;

        let payment = PaymentRequest {
            id: format!("preq_{}", uuid::Uuid::new_v4().simple()),
            payment_token,
            account_id: account.map(|a| a.id.clone()),
            chain,
            deposit_address,
            credits_requested: tier.credits,
            usd_amount: tier.usd,
            required_amount: quote.smallest_unit_amount,
            status: PaymentState::Pending,
            confirmations_seen: 0,
            created_at: UnixTimestamp::now(),
            confirmed_at: None,
            claimed_at: None,
        };
        self.store.insert_payment(payment).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(
            payment_token = %quote.payment_token,
            %chain,
            credits,
            required = quote.smallest_unit_amount,
            "payment request created"
        );
        Ok(quote)
    }

    /// Returns a stored payment request.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] for an unknown token.
    pub async fn payment(&self, token: &str) -> Result<PaymentRequest, CreditError> {
        self.store
            .payment_by_token(token)
            .await?
            .ok_or_else(|| CreditError::not_found(EntityKind::Payment, token))
    }

    /// Reports a payment's status, querying the chain when it can still change.
    ///
    /// Claimed payments, and confirmed ones unless `force` is set, are
    /// answered from storage.
    ///
    /// # Errors
    ///
    /// [`CreditError::NotFound`] for an unknown token. Provider failures are
    /// reported in the view, not as errors.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn poll_status(&self, token: &str, force: bool) -> Result<PaymentView, CreditError> {
        let payment = self.payment(token).await?;
        if payment.status == PaymentState::Claimed {
            return Ok(PaymentView::new(payment, Verification::Cached, None));
        }
        let _guard = self.locks.lock(token).await;
        let payment = self.payment(token).await?;
        let cached = match payment.status {
            PaymentState::Claimed => true,
            PaymentState::Confirmed => !force,
            PaymentState::Pending => false,
        };
        if cached {
            return Ok(PaymentView::new(payment, Verification::Cached, None));
        }

        match self.verify(&payment).await {
            Ok(status) => {
                let payment = self.record(payment, &status).await?;
                Ok(PaymentView::new(payment, Verification::Live, Some(status)))
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(payment_token = %token, error = %err, "verification unavailable");
                Ok(PaymentView::new(
                    payment,
                    Verification::Unavailable {
                        reason: err.to_string(),
                    },
                    None,
                ))
            }
        }
    }

    /// Grants a confirmed payment's credits to an account, exactly once.
    ///
    /// # Errors
    ///
    /// - [`CreditError::NotFound`] for an unknown token
    /// - [`CreditError::Conflict`] naming `claimed` or `pending`
    /// - [`CreditError::Unauthorized`] for a bad credential or a payment bound
    ///   to another account
    /// - [`CreditError::ProviderUnavailable`] if live re-verification fails
    #[cfg_attr(feature = "telemetry", instrument(skip(self, target), err))]
    pub async fn claim(&self, token: &str, target: ClaimTarget) -> Result<ClaimResult, CreditError> {
        if self.payment(token).await?.claimed_at.is_some() {
            return Err(CreditError::conflict(EntityKind::Payment, PaymentState::Claimed));
        }
        let guard = self.locks.lock(token).await;
        let mut payment = self.payment(token).await?;
        if payment.claimed_at.is_some() {
            return Err(CreditError::conflict(EntityKind::Payment, PaymentState::Claimed));
        }

        let (beneficiary, credential) = match target {
            ClaimTarget::Existing(credential) => {
                let account = self.ledger.authenticate(&credential).await?;
                (Beneficiary::Existing(account.id), None)
            }
            ClaimTarget::NewAccount => {
                let credential = Credential::generate();
                let account = CreditAccount::open(&credential, UnixTimestamp::now());
                (Beneficiary::New(account), Some(credential))
            }
        };
        if let Some(bound) = &payment.account_id
            && bound != beneficiary.account_id()
        {
            return Err(CreditError::Unauthorized(
                "payment is bound to a different account".into(),
            ));
        }

        if payment.status == PaymentState::Pending {
            let status = self.verify(&payment).await?;
            payment = self.record(payment, &status).await?;
            if payment.status == PaymentState::Pending {
                return Err(CreditError::conflict(EntityKind::Payment, PaymentState::Pending));
            }
        }

        let receipt = self
            .store
            .claim_payment(token, beneficiary, UnixTimestamp::now())
            .await?;
        drop(guard);

        #[cfg(feature = "telemetry")]
        tracing::info!(
            payment_token = %token,
            account_id = %receipt.account.id,
            credits = receipt.payment.credits_requested,
            "payment claimed"
        );
        Ok(ClaimResult {
            payment_token: receipt.payment.payment_token,
            account_id: receipt.account.id,
            credits_added: receipt.payment.credits_requested,
            balance: receipt.account.credits,
            transaction: receipt.transaction,
            credential: credential.map(|c| c.expose().to_owned()),
        })
    }

    /// Queries the adapter for `payment` under the provider timeout.
    async fn verify(&self, payment: &PaymentRequest) -> Result<PaymentStatus, CreditError> {
        let adapter: &Arc<dyn ChainAdapter> = self.adapters.get(payment.chain)?;
        self.bounded(
            payment.chain,
            adapter.check_status(&payment.deposit_address, payment.required_amount),
        )
        .await
    }

    /// Stores what a successful verification learned.
    async fn record(
        &self,
        payment: PaymentRequest,
        status: &PaymentStatus,
    ) -> Result<PaymentRequest, CreditError> {
        let token = &payment.payment_token;
        if status.is_confirmed && payment.status == PaymentState::Pending {
            let confirmed = self
                .store
                .mark_confirmed(token, status.confirmations, UnixTimestamp::now())
                .await?;
            #[cfg(feature = "telemetry")]
            tracing::info!(payment_token = %token, confirmations = status.confirmations, "payment confirmed");
            return Ok(confirmed);
        }
        self.store
            .record_confirmations(token, status.confirmations)
            .await?;
        self.payment(token).await
    }

    async fn bounded<T>(
        &self,
        chain: Chain,
        call: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, CreditError> {
        match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChainError::Timeout {
                chain: chain.as_str(),
            }
            .into()),
        }
    }
}
