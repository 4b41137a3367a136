//! Axum route handlers.
//!
//! Purchase endpoints accept an optional bearer credential; account and
//! escrow endpoints require one. Every handler is a thin wrapper over one
//! service call.

use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use credex::account::{CreditAccount, CreditTransaction};
use credex::adapter::Quote;
use credex::chain::Chain;
use credex::error::CreditError;
use credex::escrow::{EscrowHold, HoldReceipt};
use credex::settlement::{ClaimResult, ClaimTarget, PaymentView};
use credex::store::HoldOutcome;
use credex::tier::Tier;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::Bearer;
use crate::error::ApiError;
use crate::state::CreditState;

type ApiResult<T> = Result<T, ApiError>;

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Response of `GET /v1/tiers`.
#[derive(Debug, Serialize)]
pub struct TiersResponse {
    /// Purchasable tiers.
    pub tiers: &'static [Tier],
    /// Chains that can be paid on.
    pub chains: Vec<Chain>,
}

/// `GET /v1/tiers`
pub async fn get_tiers(State(state): State<CreditState>) -> Json<TiersResponse> {
    let mut chains = state.settlement.chains();
    chains.sort();
    Json(TiersResponse {
        tiers: state.settlement.tiers(),
        chains,
    })
}

/// Body of `POST /v1/payments`.
#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    /// Tier quantity.
    pub credits: u64,
    /// Chain name, e.g. `polygon`.
    pub chain: String,
}

/// `POST /v1/payments`
///
/// A bearer credential binds the purchase to that account.
///
/// # Errors
///
/// 400 for an unknown chain or tier, 401 for a bad credential, 503 if pricing fails.
pub async fn post_payment(
    State(state): State<CreditState>,
    bearer: Option<Bearer>,
    Json(body): Json<InitiateRequest>,
) -> ApiResult<(StatusCode, Json<Quote>)> {
    let chain = Chain::from_str(&body.chain).map_err(|e| CreditError::Validation(e.to_string()))?;
    let account = match bearer {
        Some(Bearer(credential)) => Some(state.ledger.authenticate(&credential).await?),
        None => None,
    };
    let quote = state
        .settlement
        .initiate(body.credits, chain, account.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

/// Query of `GET /v1/payments/{token}`.
#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// Re-verify a confirmed payment against the chain.
    #[serde(default)]
    pub force: bool,
}

/// `GET /v1/payments/{token}?force=bool`
///
/// # Errors
///
/// 404 for an unknown token. Provider failures are reported in the body.
pub async fn get_payment(
    State(state): State<CreditState>,
    Path(token): Path<String>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<PaymentView>> {
    Ok(Json(state.settlement.poll_status(&token, query.force).await?))
}

/// `POST /v1/payments/{token}/claim`
///
/// With a bearer credential the credits go to that account; without one a
/// new account is created and its credential returned once.
///
/// # Errors
///
/// 404, 409 naming `claimed` or `pending`, 401, or 503.
pub async fn post_claim(
    State(state): State<CreditState>,
    Path(token): Path<String>,
    bearer: Option<Bearer>,
) -> ApiResult<Json<ClaimResult>> {
    let target = bearer.map_or(ClaimTarget::NewAccount, |Bearer(c)| ClaimTarget::Existing(c));
    Ok(Json(state.settlement.claim(&token, target).await?))
}

/// `GET /v1/account`
///
/// # Errors
///
/// 401 for a missing or bad credential.
pub async fn get_account(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
) -> ApiResult<Json<CreditAccount>> {
    Ok(Json(state.ledger.authenticate(&credential).await?))
}

/// Query of `GET /v1/account/transactions`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Only the most recent `limit` rows.
    pub limit: Option<usize>,
}

/// `GET /v1/account/transactions?limit=n`
///
/// # Errors
///
/// 401 for a missing or bad credential.
pub async fn get_transactions(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<CreditTransaction>>> {
    let account = state.ledger.authenticate(&credential).await?;
    Ok(Json(state.ledger.history(&account.id, query.limit).await?))
}

/// Body of `POST /v1/escrow/holds`.
#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    /// USD amount of the job.
    pub amount_usd: Decimal,
    /// Opaque marketplace reference.
    pub reference: String,
    /// Opaque marketplace service name.
    pub service: String,
}

/// `POST /v1/escrow/holds`
///
/// # Errors
///
/// 400 for a non-positive amount, 402 with `credits_required` and
/// `credits_available` when the balance is short.
pub async fn post_hold(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
    Json(body): Json<HoldRequest>,
) -> ApiResult<(StatusCode, Json<HoldReceipt>)> {
    let account = state.ledger.authenticate(&credential).await?;
    let receipt = state
        .escrow
        .hold(&account.id, body.amount_usd, &body.reference, &body.service)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /v1/escrow/holds`
///
/// # Errors
///
/// 401 for a missing or bad credential.
pub async fn list_holds(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
) -> ApiResult<Json<Vec<EscrowHold>>> {
    let account = state.ledger.authenticate(&credential).await?;
    Ok(Json(state.escrow.list(&account.id).await?))
}

/// `GET /v1/escrow/holds/{id}`
///
/// # Errors
///
/// 404 for an unknown hold, 401 for another account's hold.
pub async fn get_hold(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
    Path(id): Path<String>,
) -> ApiResult<Json<EscrowHold>> {
    let account = state.ledger.authenticate(&credential).await?;
    Ok(Json(state.escrow.get(&id, &account.id).await?))
}

/// `POST /v1/escrow/holds/{id}/release`
///
/// # Errors
///
/// 404, 401, or 409 naming the hold's status.
pub async fn post_release(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
    Path(id): Path<String>,
) -> ApiResult<Json<HoldOutcome>> {
    let account = state.ledger.authenticate(&credential).await?;
    Ok(Json(state.escrow.release(&id, &account.id).await?))
}

/// Body of `POST /v1/escrow/holds/{id}/void`. The body may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct VoidRequest {
    /// Percentage to refund, `0..=100` (default 100).
    pub refund_percent: Option<u64>,
}

/// `POST /v1/escrow/holds/{id}/void`
///
/// # Errors
///
/// 400 for a percentage outside `0..=100`, otherwise as for release.
pub async fn post_void(
    State(state): State<CreditState>,
    Bearer(credential): Bearer,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<HoldOutcome>> {
    let request: VoidRequest = if body.is_empty() {
        VoidRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| CreditError::Validation(format!("invalid request body: {e}")))?
    };
    let refund_percent = request
        .refund_percent
        .map(|p| {
            u8::try_from(p).ok().filter(|p| *p <= 100).ok_or_else(|| {
                CreditError::Validation(format!(
                    "refund_percent must be between 0 and 100, got {p}"
                ))
            })
        })
        .transpose()?;
    let account = state.ledger.authenticate(&credential).await?;
    Ok(Json(state.escrow.void(&id, &account.id, refund_percent).await?))
}

/// Creates the API [`Router`].
pub fn credit_router(state: CreditState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tiers", get(get_tiers))
        .route("/v1/payments", post(post_payment))
        .route("/v1/payments/{token}", get(get_payment))
        .route("/v1/payments/{token}/claim", post(post_claim))
        .route("/v1/account", get(get_account))
        .route("/v1/account/transactions", get(get_transactions))
        .route("/v1/escrow/holds", post(post_hold).get(list_holds))
        .route("/v1/escrow/holds/{id}", get(get_hold))
        .route("/v1/escrow/holds/{id}/release", post(post_release))
        .route("/v1/escrow/holds/{id}/void", post(post_void))
        .with_state(state)
}
