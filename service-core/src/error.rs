use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Payment verification pending")]
    VerificationPending,

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code rendered next to the message.
    ///
    /// Clients branch on this: `validation` is shown inline, `payment_failed`
    /// ends the attempt, `verification_pending` asks for a refresh instead of
    /// a second payment, `unauthenticated` clears the cached identity.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) | AppError::InvalidToken(_) => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::PaymentFailed(_) => "payment_failed",
            AppError::VerificationPending => "verification_pending",
            AppError::TooManyRequests(_, _) => "rate_limited",
            AppError::BadGateway(_) => "upstream",
            AppError::ServiceUnavailable => "unavailable",
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                "internal"
            }
        }
    }

    /// Whether the caller may simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::InternalError(_)
                | AppError::DatabaseError(_)
                | AppError::BadGateway(_)
                | AppError::ServiceUnavailable
                | AppError::TooManyRequests(_, _)
                | AppError::VerificationPending
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let retryable = self.is_retryable();

        let (status, error_message, details, retry_after) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None, None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, None),
            AppError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err.to_string(), None, None),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string(), None, None),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string(), None, None),
            AppError::PaymentFailed(reason) => (
                StatusCode::PAYMENT_REQUIRED,
                "Payment failed".to_string(),
                Some(reason),
                None,
            ),
            AppError::VerificationPending => (
                StatusCode::ACCEPTED,
                "Payment received but not yet confirmed. Refresh shortly instead of paying again."
                    .to_string(),
                None,
                None,
            ),
            AppError::TooManyRequests(msg, retry) => {
                (StatusCode::TOO_MANY_REQUESTS, msg, None, retry)
            }
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    None,
                )
            }
            AppError::BadGateway(msg) => {
                tracing::warn!(error = %msg, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "Payment provider unavailable".to_string(),
                    None,
                    None,
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
                None,
            ),
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                    None,
                )
            }
            AppError::InvalidToken(err) => (
                StatusCode::UNAUTHORIZED,
                "Invalid token".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Configuration error".to_string(),
                    None,
                    None,
                )
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                success: false,
                error: error_message,
                code,
                retryable,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_failure_maps_to_402() {
        let res = AppError::PaymentFailed("card declined".to_string()).into_response();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn verification_lag_is_not_a_hard_failure() {
        let err = AppError::VerificationPending;
        assert_eq!(err.code(), "verification_pending");
        assert!(err.is_retryable());
        assert_eq!(err.into_response().status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let res = AppError::TooManyRequests("slow down".to_string(), Some(7)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            res.headers().get(axum::http::header::RETRY_AFTER).unwrap(),
            "7"
        );
    }

    #[test]
    fn payment_failure_is_terminal() {
        assert!(!AppError::PaymentFailed("x".into()).is_retryable());
        assert!(!AppError::BadRequest(anyhow::anyhow!("x")).is_retryable());
    }
}
