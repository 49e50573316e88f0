use crate::error::{is_unique_violation, SettlementError};
use crate::fees;
use crate::gateway::EventOutcome;
use crate::ledger::{self, TxnSpec};
use crate::models::{AcceptOfferOut, BookingOut, BookingRegisterReq};
use crate::state::AppState;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

pub const BOOKING_PENDING: &str = "pending";
pub const BOOKING_AWAITING_PAYMENT: &str = "awaiting_payment";
pub const BOOKING_PAID: &str = "paid";
pub const BOOKING_PAYMENT_FAILED: &str = "payment_failed";
pub const BOOKING_REFUNDED: &str = "refunded";

pub const METHOD_WALLET: &str = "wallet";
pub const METHOD_CARD: &str = "card";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayMethod {
    Wallet,
    Card,
}

impl PayMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            METHOD_WALLET => Some(PayMethod::Wallet),
            METHOD_CARD => Some(PayMethod::Card),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookingRow {
    pub id: String,
    pub offer_id: String,
    pub payer_user_id: String,
    pub payee_user_id: String,
    pub price_per_seat_cents: i64,
    pub seats: i32,
    pub status: String,
    pub payment_method: Option<String>,
    pub payment_intent_id: Option<String>,
}

impl BookingRow {
    pub fn gross_cents(&self) -> Result<i64, SettlementError> {
        fees::gross_amount(self.price_per_seat_cents, self.seats)
    }
}

fn booking_from_row(row: &PgRow) -> BookingRow {
    BookingRow {
        id: row.try_get("id").unwrap_or_default(),
        offer_id: row.try_get("offer_id").unwrap_or_default(),
        payer_user_id: row.try_get("payer_user_id").unwrap_or_default(),
        payee_user_id: row.try_get("payee_user_id").unwrap_or_default(),
        price_per_seat_cents: row.try_get("price_per_seat_cents").unwrap_or(0),
        seats: row.try_get("seats").unwrap_or(0),
        status: row.try_get("status").unwrap_or_default(),
        payment_method: row.try_get("payment_method").unwrap_or(None),
        payment_intent_id: row.try_get("payment_intent_id").unwrap_or(None),
    }
}

const BOOKING_COLUMNS: &str = "id,offer_id,payer_user_id,payee_user_id,price_per_seat_cents,seats,status,payment_method,payment_intent_id";

async fn fetch_booking_for_update(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    booking_id: &str,
) -> Result<Option<BookingRow>, SettlementError> {
    let bookings = state.table("bookings");
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1 FOR UPDATE"
    ))
    .bind(booking_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("booking lock", e))?;
    Ok(row.as_ref().map(booking_from_row))
}

pub async fn find_booking_by_intent(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    intent_id: &str,
) -> Result<Option<BookingRow>, SettlementError> {
    let bookings = state.table("bookings");
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE payment_intent_id=$1 FOR UPDATE"
    ))
    .bind(intent_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("booking lookup by intent", e))?;
    Ok(row.as_ref().map(booking_from_row))
}

/// Register the settlement context for an accepted offer. Idempotent for the
/// ride service's own retries: re-registering the same booking/offer pair
/// returns the existing row.
pub async fn register_booking(
    state: &AppState,
    req: &BookingRegisterReq,
) -> Result<BookingOut, SettlementError> {
    let gross = fees::gross_amount(req.price_per_seat_cents, req.seats)?;
    let bookings = state.table("bookings");

    let res = sqlx::query(&format!(
        "INSERT INTO {bookings} (id,offer_id,payer_user_id,payee_user_id,price_per_seat_cents,seats,status,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"
    ))
    .bind(&req.booking_id)
    .bind(&req.offer_id)
    .bind(&req.payer_user_id)
    .bind(&req.payee_user_id)
    .bind(req.price_per_seat_cents)
    .bind(req.seats)
    .bind(BOOKING_PENDING)
    .bind(Utc::now().to_rfc3339())
    .execute(&state.pool)
    .await;

    match res {
        Ok(_) => Ok(BookingOut {
            booking_id: req.booking_id.clone(),
            offer_id: req.offer_id.clone(),
            status: BOOKING_PENDING.to_string(),
            gross_cents: gross,
            payment_method: None,
        }),
        Err(e) if is_unique_violation(&e) => {
            let row = sqlx::query(&format!(
                "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1"
            ))
            .bind(&req.booking_id)
            .fetch_optional(&state.pool)
            .await
            .map_err(|e| SettlementError::from_db("booking refetch", e))?
            .ok_or(SettlementError::BookingNotFound)?;
            let existing = booking_from_row(&row);
            if existing.offer_id != req.offer_id {
                return Err(SettlementError::BookingMismatch);
            }
            let gross = existing.gross_cents()?;
            Ok(BookingOut {
                booking_id: existing.id,
                offer_id: existing.offer_id,
                status: existing.status,
                gross_cents: gross,
                payment_method: existing.payment_method,
            })
        }
        Err(e) => Err(SettlementError::from_db("booking register", e)),
    }
}

fn check_context(
    booking: &BookingRow,
    offer_id: &str,
    payer_user_id: &str,
    state: &AppState,
) -> Result<(), SettlementError> {
    if booking.offer_id != offer_id || booking.payer_user_id != payer_user_id {
        return Err(SettlementError::BookingMismatch);
    }
    if booking.payer_user_id == booking.payee_user_id {
        return Err(SettlementError::BookingMismatch);
    }
    if booking.payer_user_id == state.platform_wallet_user_id
        || booking.payee_user_id == state.platform_wallet_user_id
    {
        return Err(SettlementError::BookingMismatch);
    }
    Ok(())
}

pub async fn accept_offer_with_payment(
    state: &AppState,
    booking_id: &str,
    offer_id: &str,
    payer_user_id: &str,
    method: PayMethod,
) -> Result<AcceptOfferOut, SettlementError> {
    match method {
        PayMethod::Wallet => settle_by_wallet(state, booking_id, offer_id, payer_user_id).await,
        PayMethod::Card => settle_by_card(state, booking_id, offer_id, payer_user_id).await,
    }
}

/// Wallet-path settlement: one database transaction covering the conditional
/// booking transition and all three wallet movements. Synchronous and final.
async fn settle_by_wallet(
    state: &AppState,
    booking_id: &str,
    offer_id: &str,
    payer_user_id: &str,
) -> Result<AcceptOfferOut, SettlementError> {
    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| SettlementError::from_db("settle begin", e))?;

    let booking = fetch_booking_for_update(&mut tx, state, booking_id)
        .await?
        .ok_or(SettlementError::BookingNotFound)?;
    check_context(&booking, offer_id, payer_user_id, state)?;
    if booking.status != BOOKING_PENDING {
        return Err(SettlementError::BookingNotSettleable);
    }

    let gross = booking.gross_cents()?;
    let split = fees::compute_settlement(gross, state.driver_share_percent)?;

    // The row is locked, but the transition stays conditional: a retried
    // request can never settle a booking twice.
    let bookings = state.table("bookings");
    let res = sqlx::query(&format!(
        "UPDATE {bookings} SET status=$1, payment_method=$2 WHERE id=$3 AND status=$4"
    ))
    .bind(BOOKING_PAID)
    .bind(METHOD_WALLET)
    .bind(booking_id)
    .bind(BOOKING_PENDING)
    .execute(&mut *tx)
    .await
    .map_err(|e| SettlementError::from_db("booking transition", e))?;
    if res.rows_affected() == 0 {
        return Err(SettlementError::BookingNotSettleable);
    }

    let wallets = ledger::ensure_wallets_locked(
        &mut tx,
        state,
        &[
            booking.payer_user_id.as_str(),
            booking.payee_user_id.as_str(),
            state.platform_wallet_user_id.as_str(),
        ],
    )
    .await?;
    let (payer, payee, platform) = (&wallets[0], &wallets[1], &wallets[2]);

    ledger::debit(
        &mut tx,
        state,
        payer,
        TxnSpec {
            kind: ledger::KIND_RIDE_PAYMENT,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: -gross,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;
    ledger::credit(
        &mut tx,
        state,
        payee,
        TxnSpec {
            kind: ledger::KIND_RIDE_EARNING,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: split.driver_net_cents,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;
    ledger::credit(
        &mut tx,
        state,
        platform,
        TxnSpec {
            kind: ledger::KIND_PLATFORM_FEE,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: split.platform_fee_cents,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| SettlementError::from_db("settle commit", e))?;

    tracing::info!(booking_id, gross, "wallet settlement completed");
    Ok(AcceptOfferOut {
        booking_id: booking_id.to_string(),
        status: BOOKING_PAID.to_string(),
        gross_cents: gross,
        intent_id: None,
        client_secret: None,
    })
}

/// Card-path: create the gateway intent first, outside any lock or open
/// transaction, then conditionally mark the booking awaiting payment. Ledger
/// effects are deferred to the confirmation webhook.
async fn settle_by_card(
    state: &AppState,
    booking_id: &str,
    offer_id: &str,
    payer_user_id: &str,
) -> Result<AcceptOfferOut, SettlementError> {
    let bookings = state.table("bookings");
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1"
    ))
    .bind(booking_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| SettlementError::from_db("booking lookup", e))?
    .ok_or(SettlementError::BookingNotFound)?;
    let booking = booking_from_row(&row);
    check_context(&booking, offer_id, payer_user_id, state)?;

    // A retry that lost the first response may come back while the booking is
    // already awaiting payment; the idempotency key below resolves to the
    // same gateway intent, so the client can still obtain its secret.
    let retryable_card_state = booking.status == BOOKING_AWAITING_PAYMENT
        && booking.payment_method.as_deref() == Some(METHOD_CARD);
    if booking.status != BOOKING_PENDING && !retryable_card_state {
        return Err(SettlementError::BookingNotSettleable);
    }

    let gross = booking.gross_cents()?;
    let gateway = state.card_gateway.as_ref().ok_or_else(|| {
        tracing::error!("card gateway not configured");
        SettlementError::GatewayUnavailable
    })?;

    let idempotency_key = format!("booking-{booking_id}-{offer_id}");
    let intent = gateway
        .create_payment_intent(gross, &state.default_currency, booking_id, &idempotency_key)
        .await?;

    let res = sqlx::query(&format!(
        "UPDATE {bookings} SET status=$1, payment_method=$2, payment_intent_id=$3 \
         WHERE id=$4 AND (status=$5 OR (status=$1 AND payment_intent_id=$3))"
    ))
    .bind(BOOKING_AWAITING_PAYMENT)
    .bind(METHOD_CARD)
    .bind(&intent.intent_id)
    .bind(booking_id)
    .bind(BOOKING_PENDING)
    .execute(&state.pool)
    .await
    .map_err(|e| SettlementError::from_db("booking intent transition", e))?;
    if res.rows_affected() == 0 {
        // Lost a race against another settlement path or a webhook; the
        // intent is left to the reconciliation sweep.
        return Err(SettlementError::BookingNotSettleable);
    }

    tracing::info!(booking_id, intent_id = %intent.intent_id, "payment intent created");
    Ok(AcceptOfferOut {
        booking_id: booking_id.to_string(),
        status: BOOKING_AWAITING_PAYMENT.to_string(),
        gross_cents: gross,
        intent_id: Some(intent.intent_id),
        client_secret: Some(intent.client_secret),
    })
}

/// How a card webhook application ended: fresh ledger effect, or a no-op
/// because the booking already reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardApplication {
    Applied,
    AlreadyFinal,
}

/// Apply a terminal card outcome inside the caller's transaction. The caller
/// owns the idempotency record and the commit; any error here rolls both
/// back so the gateway's retry can deliver the event again.
pub async fn apply_card_outcome(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    intent_id: &str,
    outcome: EventOutcome,
) -> Result<CardApplication, SettlementError> {
    let booking = find_booking_by_intent(tx, state, intent_id)
        .await?
        .ok_or_else(|| SettlementError::UnknownBookingForIntent(intent_id.to_string()))?;

    let bookings = state.table("bookings");
    match outcome {
        EventOutcome::Succeeded => {
            if booking.status == BOOKING_PAID {
                return Ok(CardApplication::AlreadyFinal);
            }
            if booking.status != BOOKING_AWAITING_PAYMENT {
                // A success after we recorded a terminal failure means the
                // gateway contradicted itself; keep the money trail loud.
                tracing::error!(
                    booking_id = %booking.id,
                    intent_id,
                    status = %booking.status,
                    "charge succeeded for booking not awaiting payment"
                );
                return Ok(CardApplication::AlreadyFinal);
            }

            let gross = booking.gross_cents()?;
            let split = fees::compute_settlement(gross, state.driver_share_percent)?;

            let res = sqlx::query(&format!(
                "UPDATE {bookings} SET status=$1 WHERE id=$2 AND status=$3"
            ))
            .bind(BOOKING_PAID)
            .bind(&booking.id)
            .bind(BOOKING_AWAITING_PAYMENT)
            .execute(&mut **tx)
            .await
            .map_err(|e| SettlementError::from_db("booking paid transition", e))?;
            if res.rows_affected() == 0 {
                return Err(SettlementError::LedgerConflict);
            }

            // The gross arrived through the card network; only the internal
            // credits are ledger movements.
            let wallets = ledger::ensure_wallets_locked(
                tx,
                state,
                &[
                    booking.payee_user_id.as_str(),
                    state.platform_wallet_user_id.as_str(),
                ],
            )
            .await?;
            let (payee, platform) = (&wallets[0], &wallets[1]);
            ledger::credit(
                tx,
                state,
                payee,
                TxnSpec {
                    kind: ledger::KIND_RIDE_EARNING,
                    gross_cents: gross,
                    fee_cents: split.platform_fee_cents,
                    net_cents: split.driver_net_cents,
                    booking_id: Some(&booking.id),
                    payout_id: None,
                    note: None,
                },
            )
            .await?;
            ledger::credit(
                tx,
                state,
                platform,
                TxnSpec {
                    kind: ledger::KIND_PLATFORM_FEE,
                    gross_cents: gross,
                    fee_cents: split.platform_fee_cents,
                    net_cents: split.platform_fee_cents,
                    booking_id: Some(&booking.id),
                    payout_id: None,
                    note: None,
                },
            )
            .await?;

            tracing::info!(booking_id = %booking.id, intent_id, gross, "card settlement completed");
            Ok(CardApplication::Applied)
        }
        EventOutcome::Failed | EventOutcome::Canceled => {
            if booking.status != BOOKING_AWAITING_PAYMENT {
                if booking.status == BOOKING_PAID {
                    tracing::error!(
                        booking_id = %booking.id,
                        intent_id,
                        "charge failure reported for a paid booking"
                    );
                }
                return Ok(CardApplication::AlreadyFinal);
            }
            let res = sqlx::query(&format!(
                "UPDATE {bookings} SET status=$1 WHERE id=$2 AND status=$3"
            ))
            .bind(BOOKING_PAYMENT_FAILED)
            .bind(&booking.id)
            .bind(BOOKING_AWAITING_PAYMENT)
            .execute(&mut **tx)
            .await
            .map_err(|e| SettlementError::from_db("booking failed transition", e))?;
            if res.rows_affected() == 0 {
                return Err(SettlementError::LedgerConflict);
            }
            tracing::info!(booking_id = %booking.id, intent_id, "card payment failed");
            Ok(CardApplication::Applied)
        }
        EventOutcome::Unknown => Ok(CardApplication::AlreadyFinal),
    }
}

/// Reverse a wallet-path settlement. Card-paid bookings are refunded through
/// the gateway, not here.
pub async fn refund_booking(
    state: &AppState,
    booking_id: &str,
) -> Result<BookingOut, SettlementError> {
    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| SettlementError::from_db("refund begin", e))?;

    let booking = fetch_booking_for_update(&mut tx, state, booking_id)
        .await?
        .ok_or(SettlementError::BookingNotFound)?;
    if booking.status != BOOKING_PAID || booking.payment_method.as_deref() != Some(METHOD_WALLET) {
        return Err(SettlementError::BookingNotSettleable);
    }

    let gross = booking.gross_cents()?;
    let split = fees::compute_settlement(gross, state.driver_share_percent)?;

    let bookings = state.table("bookings");
    let res = sqlx::query(&format!(
        "UPDATE {bookings} SET status=$1 WHERE id=$2 AND status=$3"
    ))
    .bind(BOOKING_REFUNDED)
    .bind(booking_id)
    .bind(BOOKING_PAID)
    .execute(&mut *tx)
    .await
    .map_err(|e| SettlementError::from_db("refund transition", e))?;
    if res.rows_affected() == 0 {
        return Err(SettlementError::BookingNotSettleable);
    }

    let wallets = ledger::ensure_wallets_locked(
        &mut tx,
        state,
        &[
            booking.payer_user_id.as_str(),
            booking.payee_user_id.as_str(),
            state.platform_wallet_user_id.as_str(),
        ],
    )
    .await?;
    let (payer, payee, platform) = (&wallets[0], &wallets[1], &wallets[2]);

    // Driver or platform may have withdrawn the funds already; the refund
    // then fails with InsufficientFunds and is retried out of band rather
    // than driving a balance negative.
    ledger::debit(
        &mut tx,
        state,
        payee,
        TxnSpec {
            kind: ledger::KIND_REFUND,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: -split.driver_net_cents,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;
    ledger::debit(
        &mut tx,
        state,
        platform,
        TxnSpec {
            kind: ledger::KIND_REFUND,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: -split.platform_fee_cents,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;
    ledger::credit(
        &mut tx,
        state,
        payer,
        TxnSpec {
            kind: ledger::KIND_REFUND,
            gross_cents: gross,
            fee_cents: split.platform_fee_cents,
            net_cents: gross,
            booking_id: Some(booking_id),
            payout_id: None,
            note: None,
        },
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| SettlementError::from_db("refund commit", e))?;

    tracing::info!(booking_id, gross, "booking refunded");
    Ok(BookingOut {
        booking_id: booking_id.to_string(),
        offer_id: booking.offer_id,
        status: BOOKING_REFUNDED.to_string(),
        gross_cents: gross,
        payment_method: booking.payment_method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing_is_closed() {
        assert_eq!(PayMethod::parse("wallet"), Some(PayMethod::Wallet));
        assert_eq!(PayMethod::parse(" CARD "), Some(PayMethod::Card));
        assert_eq!(PayMethod::parse("cash"), None);
        assert_eq!(PayMethod::parse(""), None);
    }

    #[test]
    fn booking_gross_uses_checked_math() {
        let booking = BookingRow {
            id: "b1".into(),
            offer_id: "o1".into(),
            payer_user_id: "u1".into(),
            payee_user_id: "u2".into(),
            price_per_seat_cents: 2500,
            seats: 2,
            status: BOOKING_PENDING.into(),
            payment_method: None,
            payment_intent_id: None,
        };
        assert_eq!(booking.gross_cents().unwrap(), 5000);

        let broken = BookingRow {
            seats: 0,
            ..booking
        };
        assert!(broken.gross_cents().is_err());
    }
}
