use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
    code: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(ErrorBody {
            detail: self.detail.as_str(),
            code: self.code,
        });
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Domain error taxonomy for the settlement core. Validation failures carry a
/// stable machine code back to the caller; database internals never leak.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("no bank account on file")]
    BankAccountRequired,
    #[error("bank account not verified")]
    BankAccountUnverified,
    #[error("amount below minimum withdrawal")]
    BelowMinimumWithdrawal,
    #[error("payment gateway unavailable")]
    GatewayUnavailable,
    #[error("concurrent ledger mutation")]
    LedgerConflict,
    #[error("no booking for payment intent {0}")]
    UnknownBookingForIntent(String),
    #[error("no withdrawal for payout {0}")]
    UnknownPayout(String),
    #[error("booking is not in a settleable state")]
    BookingNotSettleable,
    #[error("offer or payer does not match booking")]
    BookingMismatch,
    #[error("booking not found")]
    BookingNotFound,
    #[error("wallet not found")]
    WalletNotFound,
    #[error("amount overflow")]
    AmountOverflow,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("database error")]
    Db(sqlx::Error),
}

impl SettlementError {
    /// Classify a sqlx error at the call site. Serialization failures and
    /// deadlocks become `LedgerConflict` so the caller can retry from the top.
    pub fn from_db(context: &'static str, e: sqlx::Error) -> Self {
        if let Some(code) = e.as_database_error().and_then(|d| d.code()) {
            if matches!(code.as_ref(), "40001" | "40P01") {
                tracing::warn!(error = %e, context, "ledger conflict");
                return SettlementError::LedgerConflict;
            }
        }
        tracing::error!(error = %e, context, "database error");
        SettlementError::Db(e)
    }

    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::InsufficientFunds => "insufficient_funds",
            SettlementError::BankAccountRequired => "bank_account_required",
            SettlementError::BankAccountUnverified => "bank_account_unverified",
            SettlementError::BelowMinimumWithdrawal => "below_minimum_withdrawal",
            SettlementError::GatewayUnavailable => "gateway_unavailable",
            SettlementError::LedgerConflict => "ledger_conflict",
            SettlementError::UnknownBookingForIntent(_) => "unknown_booking_for_intent",
            SettlementError::UnknownPayout(_) => "unknown_payout",
            SettlementError::BookingNotSettleable => "booking_not_settleable",
            SettlementError::BookingMismatch => "booking_mismatch",
            SettlementError::BookingNotFound => "not_found",
            SettlementError::WalletNotFound => "not_found",
            SettlementError::AmountOverflow => "amount_overflow",
            SettlementError::InvalidAmount => "invalid_amount",
            SettlementError::Db(_) => "internal",
        }
    }
}

pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.as_ref() == "23505")
        .unwrap_or(false)
}

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        let code = e.code();
        match e {
            SettlementError::InsufficientFunds
            | SettlementError::BankAccountRequired
            | SettlementError::BankAccountUnverified
            | SettlementError::BelowMinimumWithdrawal
            | SettlementError::AmountOverflow
            | SettlementError::InvalidAmount
            | SettlementError::BookingMismatch => {
                ApiError::new(StatusCode::BAD_REQUEST, code, e.to_string())
            }
            SettlementError::GatewayUnavailable => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, code, e.to_string())
            }
            SettlementError::LedgerConflict | SettlementError::BookingNotSettleable => {
                ApiError::new(StatusCode::CONFLICT, code, e.to_string())
            }
            SettlementError::UnknownBookingForIntent(_) | SettlementError::UnknownPayout(_) => {
                ApiError::new(StatusCode::NOT_FOUND, code, e.to_string())
            }
            SettlementError::BookingNotFound | SettlementError::WalletNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, code, e.to_string())
            }
            SettlementError::Db(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, "database error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_400_with_stable_codes() {
        let e = ApiError::from(SettlementError::InsufficientFunds);
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "insufficient_funds");

        let e = ApiError::from(SettlementError::BelowMinimumWithdrawal);
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "below_minimum_withdrawal");
    }

    #[test]
    fn db_errors_never_leak_details() {
        let e = ApiError::from(SettlementError::Db(sqlx::Error::RowNotFound));
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.detail, "database error");
    }

    #[test]
    fn webhook_lookup_failures_are_retriable_statuses() {
        let e = ApiError::from(SettlementError::UnknownBookingForIntent("pi_1".into()));
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.code, "unknown_booking_for_intent");

        let e = ApiError::from(SettlementError::GatewayUnavailable);
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
