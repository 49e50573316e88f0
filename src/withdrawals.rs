use crate::error::SettlementError;
use crate::gateway::EventOutcome;
use crate::ledger;
use crate::models::WithdrawalOut;
use crate::state::AppState;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

#[derive(Debug, Clone)]
pub struct BankRow {
    pub user_id: String,
    pub bank_name: Option<String>,
    pub iban_masked: Option<String>,
    pub payout_account_id: Option<String>,
    pub verified: bool,
}

fn bank_from_row(row: &PgRow) -> BankRow {
    BankRow {
        user_id: row.try_get("user_id").unwrap_or_default(),
        bank_name: row.try_get("bank_name").unwrap_or(None),
        iban_masked: row.try_get("iban_masked").unwrap_or(None),
        payout_account_id: row.try_get("payout_account_id").unwrap_or(None),
        verified: row.try_get("verified").unwrap_or(false),
    }
}

pub async fn find_bank_account(
    pool: &PgPool,
    state: &AppState,
    user_id: &str,
) -> Result<Option<BankRow>, SettlementError> {
    let banks = state.table("bank_accounts");
    let row = sqlx::query(&format!(
        "SELECT user_id,bank_name,iban_masked,payout_account_id,verified FROM {banks} WHERE user_id=$1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| SettlementError::from_db("bank account lookup", e))?;
    Ok(row.as_ref().map(bank_from_row))
}

pub async fn upsert_bank_account(
    state: &AppState,
    user_id: &str,
    bank_name: &str,
    iban_masked: &str,
    payout_account_id: &str,
    verified: bool,
) -> Result<BankRow, SettlementError> {
    let banks = state.table("bank_accounts");
    let now = Utc::now().to_rfc3339();
    let verified_at = if verified { Some(now.clone()) } else { None };
    sqlx::query(&format!(
        "INSERT INTO {banks} (user_id,bank_name,iban_masked,payout_account_id,verified,created_at,verified_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7) \
         ON CONFLICT (user_id) DO UPDATE SET \
         bank_name=EXCLUDED.bank_name, iban_masked=EXCLUDED.iban_masked, \
         payout_account_id=EXCLUDED.payout_account_id, verified=EXCLUDED.verified, \
         verified_at=EXCLUDED.verified_at"
    ))
    .bind(user_id)
    .bind(bank_name)
    .bind(iban_masked)
    .bind(payout_account_id)
    .bind(verified)
    .bind(&now)
    .bind(&verified_at)
    .execute(&state.pool)
    .await
    .map_err(|e| SettlementError::from_db("bank account upsert", e))?;

    Ok(BankRow {
        user_id: user_id.to_string(),
        bank_name: Some(bank_name.to_string()),
        iban_masked: Some(iban_masked.to_string()),
        payout_account_id: Some(payout_account_id.to_string()),
        verified,
    })
}

/// Withdrawal preconditions, checked in order; the first failure wins.
/// Balance coverage is rechecked later under the wallet row lock — this
/// function only rejects what can be rejected without it.
pub fn validate_withdrawal(
    bank: Option<&BankRow>,
    amount_cents: i64,
    minimum_cents: i64,
) -> Result<(), SettlementError> {
    if amount_cents <= 0 {
        return Err(SettlementError::InvalidAmount);
    }
    let Some(bank) = bank else {
        return Err(SettlementError::BankAccountRequired);
    };
    if !bank.verified {
        return Err(SettlementError::BankAccountUnverified);
    }
    if amount_cents < minimum_cents {
        return Err(SettlementError::BelowMinimumWithdrawal);
    }
    Ok(())
}

/// Hold the funds, then request the payout. The hold commits before the
/// adapter call so no wallet lock is ever held across the I/O boundary; an
/// adapter failure reverses the hold immediately in a compensating
/// transaction.
pub async fn request_withdrawal(
    state: &AppState,
    user_id: &str,
    amount_cents: i64,
) -> Result<WithdrawalOut, SettlementError> {
    let bank = find_bank_account(&state.pool, state, user_id).await?;
    validate_withdrawal(bank.as_ref(), amount_cents, state.minimum_withdrawal_cents)?;
    let bank = bank.expect("validated above");
    let destination = bank
        .payout_account_id
        .as_deref()
        .ok_or(SettlementError::BankAccountUnverified)?
        .to_string();

    let payout = state.payout_gateway.as_ref().ok_or_else(|| {
        tracing::error!("payout processor not configured");
        SettlementError::GatewayUnavailable
    })?;

    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| SettlementError::from_db("withdrawal begin", e))?;
    let wallet = ledger::ensure_wallet(&mut tx, state, user_id).await?;
    let txn_id = ledger::hold_for_withdrawal(&mut tx, state, &wallet, amount_cents).await?;
    tx.commit()
        .await
        .map_err(|e| SettlementError::from_db("withdrawal commit", e))?;

    // The transaction id doubles as the payout idempotency key: a retry at
    // any layer maps back to this single hold.
    match payout
        .create_payout(amount_cents, &destination, &txn_id)
        .await
    {
        Ok(created) => {
            let mut tx = state
                .pool
                .begin()
                .await
                .map_err(|e| SettlementError::from_db("payout attach begin", e))?;
            ledger::attach_payout_id(&mut tx, state, &txn_id, &created.payout_id).await?;
            tx.commit()
                .await
                .map_err(|e| SettlementError::from_db("payout attach commit", e))?;

            let refreshed = ledger::find_wallet(&state.pool, state, user_id)
                .await?
                .ok_or(SettlementError::WalletNotFound)?;
            tracing::info!(user_id, txn_id = %txn_id, payout_id = %created.payout_id, amount_cents, "withdrawal requested");
            Ok(WithdrawalOut {
                txn_id,
                status: ledger::STATUS_PENDING.to_string(),
                amount_cents,
                available_cents: refreshed.available_cents,
                pending_cents: refreshed.pending_cents,
            })
        }
        Err(e) => {
            tracing::error!(user_id, txn_id = %txn_id, "payout request failed, reversing hold");
            release_failed_hold(state, &txn_id).await?;
            Err(e)
        }
    }
}

async fn release_failed_hold(state: &AppState, txn_id: &str) -> Result<(), SettlementError> {
    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| SettlementError::from_db("hold release begin", e))?;

    let txns = state.table("wallet_txns");
    let row = sqlx::query(&format!(
        "SELECT id,wallet_id,kind,net_cents,status,payout_id FROM {txns} WHERE id=$1 FOR UPDATE"
    ))
    .bind(txn_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| SettlementError::from_db("hold lookup", e))?;

    let Some(row) = row else {
        return Err(SettlementError::UnknownPayout(txn_id.to_string()));
    };
    let txn = ledger::txn_from_row(&row);
    if txn.kind != ledger::KIND_WITHDRAWAL {
        return Err(SettlementError::UnknownPayout(txn_id.to_string()));
    }
    if txn.status != ledger::STATUS_PENDING {
        // A payout webhook beat us to it; nothing left to release.
        tx.rollback().await.ok();
        return Ok(());
    }

    ledger::reverse_withdrawal(&mut tx, state, &txn, "payout request failed").await?;
    tx.commit()
        .await
        .map_err(|e| SettlementError::from_db("hold release commit", e))
}

/// How a payout webhook application ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutApplication {
    Applied,
    AlreadyFinal,
}

/// Apply a terminal payout outcome inside the caller's transaction (the
/// caller owns the idempotency record and the commit).
pub async fn apply_payout_outcome(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    payout_id: &str,
    outcome: EventOutcome,
) -> Result<PayoutApplication, SettlementError> {
    let txn = ledger::find_withdrawal_by_payout(tx, state, payout_id)
        .await?
        .ok_or_else(|| SettlementError::UnknownPayout(payout_id.to_string()))?;

    if txn.status != ledger::STATUS_PENDING {
        return Ok(PayoutApplication::AlreadyFinal);
    }

    match outcome {
        EventOutcome::Succeeded => {
            ledger::settle_withdrawal(tx, state, &txn).await?;
            tracing::info!(payout_id, txn_id = %txn.id, "withdrawal completed");
            Ok(PayoutApplication::Applied)
        }
        EventOutcome::Failed | EventOutcome::Canceled => {
            ledger::reverse_withdrawal(tx, state, &txn, "payout failed").await?;
            tracing::info!(payout_id, txn_id = %txn.id, "withdrawal reversed");
            Ok(PayoutApplication::Applied)
        }
        EventOutcome::Unknown => Ok(PayoutApplication::AlreadyFinal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(verified: bool) -> BankRow {
        BankRow {
            user_id: "u1".into(),
            bank_name: Some("Test Bank".into()),
            iban_masked: Some("DE**1234".into()),
            payout_account_id: Some("acct_1".into()),
            verified,
        }
    }

    #[test]
    fn missing_bank_account_wins_over_minimum() {
        // 300 is below a 500 minimum, but the bank check comes first.
        let err = validate_withdrawal(None, 300, 500).unwrap_err();
        assert!(matches!(err, SettlementError::BankAccountRequired));
    }

    #[test]
    fn unverified_bank_account_wins_over_minimum() {
        let b = bank(false);
        let err = validate_withdrawal(Some(&b), 300, 500).unwrap_err();
        assert!(matches!(err, SettlementError::BankAccountUnverified));
    }

    #[test]
    fn below_minimum_is_rejected() {
        let b = bank(true);
        let err = validate_withdrawal(Some(&b), 300, 500).unwrap_err();
        assert!(matches!(err, SettlementError::BelowMinimumWithdrawal));
    }

    #[test]
    fn exact_minimum_is_accepted() {
        let b = bank(true);
        assert!(validate_withdrawal(Some(&b), 500, 500).is_ok());
    }

    #[test]
    fn non_positive_amounts_are_rejected_first() {
        let err = validate_withdrawal(None, 0, 500).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidAmount));
        let err = validate_withdrawal(None, -100, 500).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidAmount));
    }
}
