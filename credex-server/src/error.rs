//! HTTP mapping of domain errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use credex::error::CreditError;
use serde_json::{Value, json};

/// A [`CreditError`] rendered as a JSON error response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub CreditError);

impl ApiError {
    /// HTTP status for the wrapped error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            CreditError::Validation(_) => StatusCode::BAD_REQUEST,
            CreditError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CreditError::NotFound { .. } => StatusCode::NOT_FOUND,
            CreditError::Conflict { .. } => StatusCode::CONFLICT,
            CreditError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            CreditError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CreditError::Config(_) | CreditError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({ "error": self.0.to_string() });
        match &self.0 {
            CreditError::InsufficientBalance {
                required,
                available,
            } => {
                body["credits_required"] = json!(required);
                body["credits_available"] = json!(available);
            }
            CreditError::Conflict { kind, status } => {
                body["kind"] = json!(kind);
                body["status"] = json!(status);
            }
            CreditError::NotFound { kind, id } => {
                body["kind"] = json!(kind);
                body["id"] = json!(id);
            }
            CreditError::ProviderUnavailable(_) => body["retryable"] = json!(true),
            _ => {}
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credex::error::EntityKind;

    #[test]
    fn test_insufficient_balance_details() {
        let err = ApiError(CreditError::InsufficientBalance {
            required: 50,
            available: 40,
        });
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        let body = err.body();
        assert_eq!(body["credits_required"], 50);
        assert_eq!(body["credits_available"], 40);
    }

    #[test]
    fn test_conflict_names_status() {
        let err = ApiError(CreditError::conflict(EntityKind::Payment, "claimed"));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.body()["status"], "claimed");
        assert_eq!(err.body()["kind"], "payment");
    }

    #[test]
    fn test_provider_failure_is_503() {
        let err = ApiError(CreditError::ProviderUnavailable("timeout".into()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.body()["retryable"], true);
    }
}
