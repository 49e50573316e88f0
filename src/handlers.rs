use crate::error::{ApiError, ApiResult, SettlementError};
use crate::idempotency;
use crate::ledger::{self, TxnSpec};
use crate::models::*;
use crate::settlement::{self, PayMethod};
use crate::state::AppState;
use crate::withdrawals;
use axum::extract::{Path, Query, State};
use uuid::Uuid;

const MAX_CONFLICT_RETRIES: usize = 2;

const KNOWN_KINDS: &[&str] = &[
    ledger::KIND_RIDE_EARNING,
    ledger::KIND_RIDE_PAYMENT,
    ledger::KIND_WITHDRAWAL,
    ledger::KIND_WITHDRAWAL_FAILED,
    ledger::KIND_REFUND,
    ledger::KIND_BONUS,
    ledger::KIND_PLATFORM_FEE,
];

fn require_id(raw: &str, field: &str) -> Result<String, ApiError> {
    let v = raw.trim().to_string();
    if v.is_empty() {
        return Err(ApiError::bad_request(format!("{field} required")));
    }
    if v.len() > 64 {
        return Err(ApiError::bad_request(format!("invalid {field}")));
    }
    Ok(v)
}

fn require_uuid(raw: &str, field: &str) -> Result<String, ApiError> {
    let v = raw.trim().to_string();
    if Uuid::parse_str(&v).is_err() {
        return Err(ApiError::bad_request(format!("invalid {field}")));
    }
    Ok(v)
}

fn normalize_limit(raw: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    raw.unwrap_or(default).clamp(min, max)
}

pub async fn health(State(state): State<AppState>) -> axum::Json<HealthOut> {
    axum::Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "Settlement API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_wallet(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<WalletOut>> {
    let user_id = require_id(&user_id, "user_id")?;

    let wallet = ledger::find_wallet(&state.pool, &state, &user_id)
        .await
        .map_err(ApiError::from)?;
    let bank = withdrawals::find_bank_account(&state.pool, &state, &user_id)
        .await
        .map_err(ApiError::from)?;

    // Wallets are created lazily by the first money movement; a bare balance
    // read reports the empty view instead of creating a row.
    let (wallet_id, available, pending, currency) = match wallet {
        Some(w) => (Some(w.id), w.available_cents, w.pending_cents, w.currency),
        None => (None, 0, 0, state.default_currency.clone()),
    };
    let can_withdraw = bank.map(|b| b.verified).unwrap_or(false)
        && available >= state.minimum_withdrawal_cents;

    Ok(axum::Json(WalletOut {
        wallet_id,
        user_id,
        available_cents: available,
        pending_cents: pending,
        minimum_withdrawal_cents: state.minimum_withdrawal_cents,
        can_withdraw,
        currency,
    }))
}

pub async fn list_txns(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    Query(params): Query<TxnParams>,
) -> ApiResult<axum::Json<Vec<TxnItem>>> {
    let user_id = require_id(&user_id, "user_id")?;
    let limit = normalize_limit(params.limit, 50, 1, 200);
    let offset = params.offset.unwrap_or(0).max(0);

    let kind = params
        .kind
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase);
    if let Some(k) = kind.as_deref() {
        if !KNOWN_KINDS.contains(&k) {
            return Err(ApiError::bad_request("unknown transaction kind"));
        }
    }

    let items = ledger::list_txns(&state.pool, &state, &user_id, limit, offset, kind.as_deref())
        .await
        .map_err(ApiError::from)?;
    Ok(axum::Json(items))
}

pub async fn accept_offer(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    axum::Json(body): axum::Json<AcceptOfferReq>,
) -> ApiResult<axum::Json<AcceptOfferOut>> {
    let booking_id = require_uuid(&booking_id, "booking_id")?;
    let offer_id = require_id(&body.offer_id, "offer_id")?;
    let payer_user_id = require_id(&body.payer_user_id, "payer_user_id")?;
    let method = PayMethod::parse(&body.method)
        .ok_or_else(|| ApiError::bad_request("method must be wallet or card"))?;

    // Serialization failures retry the whole operation from the top; every
    // other error surfaces immediately.
    let mut attempt = 0;
    let out = loop {
        match settlement::accept_offer_with_payment(
            &state,
            &booking_id,
            &offer_id,
            &payer_user_id,
            method,
        )
        .await
        {
            Err(SettlementError::LedgerConflict) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                continue;
            }
            other => break other,
        }
    }
    .map_err(ApiError::from)?;

    Ok(axum::Json(out))
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<WithdrawalReq>,
) -> ApiResult<axum::Json<WithdrawalOut>> {
    let user_id = require_id(&body.user_id, "user_id")?;

    let mut attempt = 0;
    let out = loop {
        match withdrawals::request_withdrawal(&state, &user_id, body.amount_cents).await {
            Err(SettlementError::LedgerConflict) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                continue;
            }
            other => break other,
        }
    }
    .map_err(ApiError::from)?;

    Ok(axum::Json(out))
}

pub async fn bank_status(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<BankStatusOut>> {
    let user_id = require_id(&user_id, "user_id")?;
    let bank = withdrawals::find_bank_account(&state.pool, &state, &user_id)
        .await
        .map_err(ApiError::from)?;

    Ok(axum::Json(match bank {
        Some(b) => BankStatusOut {
            connected: true,
            verified: b.verified,
            bank_name: b.bank_name,
            iban_masked: b.iban_masked,
        },
        None => BankStatusOut {
            connected: false,
            verified: false,
            bank_name: None,
            iban_masked: None,
        },
    }))
}

pub async fn upsert_bank(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    axum::Json(body): axum::Json<BankUpsertReq>,
) -> ApiResult<axum::Json<BankStatusOut>> {
    let user_id = require_id(&user_id, "user_id")?;
    let bank_name = require_id(&body.bank_name, "bank_name")?;
    let iban_masked = require_id(&body.iban_masked, "iban_masked")?;
    let payout_account_id = require_id(&body.payout_account_id, "payout_account_id")?;

    let bank = withdrawals::upsert_bank_account(
        &state,
        &user_id,
        &bank_name,
        &iban_masked,
        &payout_account_id,
        body.verified,
    )
    .await
    .map_err(ApiError::from)?;

    Ok(axum::Json(BankStatusOut {
        connected: true,
        verified: bank.verified,
        bank_name: bank.bank_name,
        iban_masked: bank.iban_masked,
    }))
}

pub async fn register_booking(
    State(state): State<AppState>,
    axum::Json(mut body): axum::Json<BookingRegisterReq>,
) -> ApiResult<axum::Json<BookingOut>> {
    body.booking_id = require_uuid(&body.booking_id, "booking_id")?;
    body.offer_id = require_id(&body.offer_id, "offer_id")?;
    body.payer_user_id = require_id(&body.payer_user_id, "payer_user_id")?;
    body.payee_user_id = require_id(&body.payee_user_id, "payee_user_id")?;
    if body.payer_user_id == body.payee_user_id {
        return Err(ApiError::bad_request("payer and payee must differ"));
    }

    let out = settlement::register_booking(&state, &body)
        .await
        .map_err(ApiError::from)?;
    Ok(axum::Json(out))
}

pub async fn refund_booking(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<BookingOut>> {
    let booking_id = require_uuid(&booking_id, "booking_id")?;

    let mut attempt = 0;
    let out = loop {
        match settlement::refund_booking(&state, &booking_id).await {
            Err(SettlementError::LedgerConflict) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                continue;
            }
            other => break other,
        }
    }
    .map_err(ApiError::from)?;

    Ok(axum::Json(out))
}

pub async fn bonus_credit(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    axum::Json(body): axum::Json<BonusReq>,
) -> ApiResult<axum::Json<WalletOut>> {
    if !state.allow_direct_bonus {
        return Err(ApiError::forbidden("bonus credits disabled"));
    }
    let user_id = require_id(&user_id, "user_id")?;
    if body.amount_cents <= 0 {
        return Err(ApiError::bad_request("amount_cents must be > 0"));
    }
    let note = body
        .note
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin bonus failed");
        ApiError::internal("database error")
    })?;

    let wallet = ledger::ensure_wallet(&mut tx, &state, &user_id)
        .await
        .map_err(ApiError::from)?;
    ledger::credit(
        &mut tx,
        &state,
        &wallet,
        TxnSpec {
            kind: ledger::KIND_BONUS,
            gross_cents: body.amount_cents,
            fee_cents: 0,
            net_cents: body.amount_cents,
            booking_id: None,
            payout_id: None,
            note,
        },
    )
    .await
    .map_err(ApiError::from)?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit bonus failed");
        ApiError::internal("database error")
    })?;

    let refreshed = ledger::find_wallet(&state.pool, &state, &user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::internal("wallet missing after credit"))?;
    let bank = withdrawals::find_bank_account(&state.pool, &state, &user_id)
        .await
        .map_err(ApiError::from)?;
    let can_withdraw = bank.map(|b| b.verified).unwrap_or(false)
        && refreshed.available_cents >= state.minimum_withdrawal_cents;

    Ok(axum::Json(WalletOut {
        wallet_id: Some(refreshed.id),
        user_id,
        available_cents: refreshed.available_cents,
        pending_cents: refreshed.pending_cents,
        minimum_withdrawal_cents: state.minimum_withdrawal_cents,
        can_withdraw,
        currency: refreshed.currency,
    }))
}

pub async fn event_status(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let event_id = require_id(&event_id, "event_id")?;
    let processed = idempotency::is_processed(&state.pool, &state, &event_id)
        .await
        .map_err(ApiError::from)?;
    let result = if processed {
        idempotency::event_result(&state.pool, &state, &event_id)
            .await
            .map_err(ApiError::from)?
    } else {
        None
    };
    Ok(axum::Json(serde_json::json!({
        "event_id": event_id,
        "processed": processed,
        "result": result,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation_trims_and_bounds() {
        assert_eq!(require_id("  u1  ", "user_id").unwrap(), "u1");
        assert!(require_id("", "user_id").is_err());
        assert!(require_id("   ", "user_id").is_err());
        assert!(require_id(&"x".repeat(65), "user_id").is_err());
    }

    #[test]
    fn booking_ids_must_be_uuids() {
        assert!(require_uuid("not-a-uuid", "booking_id").is_err());
        let id = Uuid::new_v4().to_string();
        assert_eq!(require_uuid(&id, "booking_id").unwrap(), id);
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(normalize_limit(None, 50, 1, 200), 50);
        assert_eq!(normalize_limit(Some(0), 50, 1, 200), 1);
        assert_eq!(normalize_limit(Some(10_000), 50, 1, 200), 200);
    }

    #[test]
    fn kind_filter_only_accepts_known_kinds() {
        assert!(KNOWN_KINDS.contains(&"ride_earning"));
        assert!(KNOWN_KINDS.contains(&"withdrawal_failed"));
        assert!(!KNOWN_KINDS.contains(&"topup"));
    }
}
