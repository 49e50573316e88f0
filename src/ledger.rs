use crate::error::{is_unique_violation, SettlementError};
use crate::models::TxnItem;
use crate::state::AppState;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

pub const KIND_RIDE_EARNING: &str = "ride_earning";
pub const KIND_RIDE_PAYMENT: &str = "ride_payment";
pub const KIND_WITHDRAWAL: &str = "withdrawal";
pub const KIND_WITHDRAWAL_FAILED: &str = "withdrawal_failed";
pub const KIND_REFUND: &str = "refund";
pub const KIND_BONUS: &str = "bonus";
pub const KIND_PLATFORM_FEE: &str = "platform_fee";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct WalletRow {
    pub id: String,
    pub user_id: String,
    pub available_cents: i64,
    pub pending_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct TxnRow {
    pub id: String,
    pub wallet_id: String,
    pub kind: String,
    pub net_cents: i64,
    pub status: String,
    pub payout_id: Option<String>,
}

/// One ledger row to append. `net_cents` is signed: positive credits the
/// wallet, negative debits it.
#[derive(Debug, Clone, Copy)]
pub struct TxnSpec<'a> {
    pub kind: &'a str,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub booking_id: Option<&'a str>,
    pub payout_id: Option<&'a str>,
    pub note: Option<&'a str>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn wallet_from_row(row: &PgRow) -> WalletRow {
    WalletRow {
        id: row.try_get("id").unwrap_or_default(),
        user_id: row.try_get("user_id").unwrap_or_default(),
        available_cents: row.try_get("available_cents").unwrap_or(0),
        pending_cents: row.try_get("pending_cents").unwrap_or(0),
        currency: row.try_get("currency").unwrap_or_default(),
    }
}

pub(crate) fn txn_from_row(row: &PgRow) -> TxnRow {
    TxnRow {
        id: row.try_get("id").unwrap_or_default(),
        wallet_id: row.try_get("wallet_id").unwrap_or_default(),
        kind: row.try_get("kind").unwrap_or_default(),
        net_cents: row.try_get("net_cents").unwrap_or(0),
        status: row.try_get("status").unwrap_or_default(),
        payout_id: row.try_get("payout_id").unwrap_or(None),
    }
}

pub async fn find_wallet(
    pool: &PgPool,
    state: &AppState,
    user_id: &str,
) -> Result<Option<WalletRow>, SettlementError> {
    let wallets = state.table("wallets");
    let row = sqlx::query(&format!(
        "SELECT id,user_id,available_cents,pending_cents,currency FROM {wallets} WHERE user_id=$1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| SettlementError::from_db("wallet lookup", e))?;
    Ok(row.as_ref().map(wallet_from_row))
}

/// Lock the wallet for `user_id`, creating it lazily on first use.
///
/// The returned row is locked for the remainder of the transaction; all
/// balance reads that feed a mutation must come from here.
pub async fn ensure_wallet(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    user_id: &str,
) -> Result<WalletRow, SettlementError> {
    let wallets = state.table("wallets");
    let row = sqlx::query(&format!(
        "SELECT id,user_id,available_cents,pending_cents,currency FROM {wallets} WHERE user_id=$1 FOR UPDATE"
    ))
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("wallet lock", e))?;

    if let Some(row) = row {
        return Ok(wallet_from_row(&row));
    }

    let id = Uuid::new_v4().to_string();
    let res = sqlx::query(&format!(
        "INSERT INTO {wallets} (id,user_id,available_cents,pending_cents,currency,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6)"
    ))
    .bind(&id)
    .bind(user_id)
    .bind(0i64)
    .bind(0i64)
    .bind(&state.default_currency)
    .bind(now_iso())
    .execute(&mut **tx)
    .await;

    match res {
        Ok(_) => Ok(WalletRow {
            id,
            user_id: user_id.to_string(),
            available_cents: 0,
            pending_cents: 0,
            currency: state.default_currency.clone(),
        }),
        // Lost the lazy-create race against a concurrent transaction; the
        // caller retries from the top and finds the committed row.
        Err(e) if is_unique_violation(&e) => Err(SettlementError::LedgerConflict),
        Err(e) => Err(SettlementError::from_db("wallet create", e)),
    }
}

/// Lock (creating lazily) several distinct wallets in ascending user-id
/// order so concurrent multi-wallet settlements cannot deadlock. Results come
/// back in the order of `user_ids`.
pub async fn ensure_wallets_locked(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    user_ids: &[&str],
) -> Result<Vec<WalletRow>, SettlementError> {
    let mut order: Vec<usize> = (0..user_ids.len()).collect();
    order.sort_by_key(|&i| user_ids[i]);

    let mut out: Vec<Option<WalletRow>> = vec![None; user_ids.len()];
    for i in order {
        let wallet = ensure_wallet(tx, state, user_ids[i]).await?;
        out[i] = Some(wallet);
    }
    Ok(out.into_iter().flatten().collect())
}

pub async fn lock_wallet_by_id(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    wallet_id: &str,
) -> Result<WalletRow, SettlementError> {
    let wallets = state.table("wallets");
    let row = sqlx::query(&format!(
        "SELECT id,user_id,available_cents,pending_cents,currency FROM {wallets} WHERE id=$1 FOR UPDATE"
    ))
    .bind(wallet_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("wallet lock by id", e))?
    .ok_or(SettlementError::WalletNotFound)?;
    Ok(wallet_from_row(&row))
}

async fn write_balances(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    wallet_id: &str,
    available_cents: i64,
    pending_cents: i64,
) -> Result<(), SettlementError> {
    let wallets = state.table("wallets");
    sqlx::query(&format!(
        "UPDATE {wallets} SET available_cents=$1, pending_cents=$2 WHERE id=$3"
    ))
    .bind(available_cents)
    .bind(pending_cents)
    .bind(wallet_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("wallet balance update", e))?;
    Ok(())
}

async fn insert_txn(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    txn_id: &str,
    wallet_id: &str,
    status: &str,
    spec: TxnSpec<'_>,
) -> Result<(), SettlementError> {
    let txns = state.table("wallet_txns");
    sqlx::query(&format!(
        "INSERT INTO {txns} (id,wallet_id,kind,gross_cents,fee_cents,net_cents,status,booking_id,payout_id,note,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"
    ))
    .bind(txn_id)
    .bind(wallet_id)
    .bind(spec.kind)
    .bind(spec.gross_cents)
    .bind(spec.fee_cents)
    .bind(spec.net_cents)
    .bind(status)
    .bind(spec.booking_id)
    .bind(spec.payout_id)
    .bind(spec.note)
    .bind(now_iso())
    .execute(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("txn insert", e))?;
    Ok(())
}

/// Append a completed credit and bump the cached balance in the same
/// transaction. The wallet must already be locked via `ensure_wallet` /
/// `lock_wallet_by_id`.
pub async fn credit(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    wallet: &WalletRow,
    spec: TxnSpec<'_>,
) -> Result<String, SettlementError> {
    if spec.net_cents < 0 {
        return Err(SettlementError::InvalidAmount);
    }
    let new_available = wallet
        .available_cents
        .checked_add(spec.net_cents)
        .ok_or(SettlementError::AmountOverflow)?;

    write_balances(tx, state, &wallet.id, new_available, wallet.pending_cents).await?;
    let txn_id = Uuid::new_v4().to_string();
    insert_txn(tx, state, &txn_id, &wallet.id, STATUS_COMPLETED, spec).await?;
    Ok(txn_id)
}

/// Append a completed debit, failing with `InsufficientFunds` when the locked
/// balance cannot cover it. Two concurrent debits serialize on the row lock;
/// the second observes the reduced balance.
pub async fn debit(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    wallet: &WalletRow,
    spec: TxnSpec<'_>,
) -> Result<String, SettlementError> {
    if spec.net_cents > 0 {
        return Err(SettlementError::InvalidAmount);
    }
    let new_available = wallet.available_cents + spec.net_cents;
    if new_available < 0 {
        return Err(SettlementError::InsufficientFunds);
    }

    write_balances(tx, state, &wallet.id, new_available, wallet.pending_cents).await?;
    let txn_id = Uuid::new_v4().to_string();
    insert_txn(tx, state, &txn_id, &wallet.id, STATUS_COMPLETED, spec).await?;
    Ok(txn_id)
}

/// Move `amount` from available to pending and append the pending
/// `withdrawal` row that tracks the in-flight payout.
pub async fn hold_for_withdrawal(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    wallet: &WalletRow,
    amount_cents: i64,
) -> Result<String, SettlementError> {
    if amount_cents <= 0 {
        return Err(SettlementError::InvalidAmount);
    }
    if wallet.available_cents < amount_cents {
        return Err(SettlementError::InsufficientFunds);
    }
    let new_available = wallet.available_cents - amount_cents;
    let new_pending = wallet
        .pending_cents
        .checked_add(amount_cents)
        .ok_or(SettlementError::AmountOverflow)?;

    write_balances(tx, state, &wallet.id, new_available, new_pending).await?;
    let txn_id = Uuid::new_v4().to_string();
    insert_txn(
        tx,
        state,
        &txn_id,
        &wallet.id,
        STATUS_PENDING,
        TxnSpec {
            kind: KIND_WITHDRAWAL,
            gross_cents: amount_cents,
            fee_cents: 0,
            net_cents: -amount_cents,
            booking_id: None,
            payout_id: None,
            note: None,
        },
    )
    .await?;
    Ok(txn_id)
}

pub async fn find_withdrawal_by_payout(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    payout_id: &str,
) -> Result<Option<TxnRow>, SettlementError> {
    let txns = state.table("wallet_txns");
    let row = sqlx::query(&format!(
        "SELECT id,wallet_id,kind,net_cents,status,payout_id FROM {txns} \
         WHERE payout_id=$1 AND kind=$2 FOR UPDATE"
    ))
    .bind(payout_id)
    .bind(KIND_WITHDRAWAL)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("withdrawal lookup by payout", e))?;
    Ok(row.as_ref().map(txn_from_row))
}

pub async fn attach_payout_id(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    txn_id: &str,
    payout_id: &str,
) -> Result<(), SettlementError> {
    let txns = state.table("wallet_txns");
    sqlx::query(&format!(
        "UPDATE {txns} SET payout_id=$1 WHERE id=$2 AND payout_id IS NULL"
    ))
    .bind(payout_id)
    .bind(txn_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("payout id attach", e))?;
    Ok(())
}

async fn set_txn_status(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    txn_id: &str,
    from: &str,
    to: &str,
) -> Result<bool, SettlementError> {
    let txns = state.table("wallet_txns");
    let res = sqlx::query(&format!(
        "UPDATE {txns} SET status=$1 WHERE id=$2 AND status=$3"
    ))
    .bind(to)
    .bind(txn_id)
    .bind(from)
    .execute(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("txn status update", e))?;
    Ok(res.rows_affected() > 0)
}

/// Payout confirmed: the held amount leaves pending and the withdrawal
/// becomes part of the completed ledger sum.
pub async fn settle_withdrawal(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    txn: &TxnRow,
) -> Result<(), SettlementError> {
    let amount = -txn.net_cents;
    let wallet = lock_wallet_by_id(tx, state, &txn.wallet_id).await?;
    if wallet.pending_cents < amount {
        tracing::error!(txn_id = %txn.id, "pending balance below withdrawal hold");
        return Err(SettlementError::LedgerConflict);
    }
    if !set_txn_status(tx, state, &txn.id, STATUS_PENDING, STATUS_COMPLETED).await? {
        return Err(SettlementError::LedgerConflict);
    }
    write_balances(
        tx,
        state,
        &wallet.id,
        wallet.available_cents,
        wallet.pending_cents - amount,
    )
    .await
}

/// Payout failed: release the hold back to available and append the
/// compensating `withdrawal_failed` row. The failed withdrawal and its
/// reversal are written in one transaction and cancel exactly, so the
/// ledger sum stays consistent. History is appended to, never rewritten.
pub async fn reverse_withdrawal(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    txn: &TxnRow,
    note: &str,
) -> Result<String, SettlementError> {
    let amount = -txn.net_cents;
    let wallet = lock_wallet_by_id(tx, state, &txn.wallet_id).await?;
    if wallet.pending_cents < amount {
        tracing::error!(txn_id = %txn.id, "pending balance below withdrawal hold");
        return Err(SettlementError::LedgerConflict);
    }
    if !set_txn_status(tx, state, &txn.id, STATUS_PENDING, STATUS_FAILED).await? {
        return Err(SettlementError::LedgerConflict);
    }

    let new_available = wallet
        .available_cents
        .checked_add(amount)
        .ok_or(SettlementError::AmountOverflow)?;
    write_balances(
        tx,
        state,
        &wallet.id,
        new_available,
        wallet.pending_cents - amount,
    )
    .await?;

    let reversal_id = Uuid::new_v4().to_string();
    insert_txn(
        tx,
        state,
        &reversal_id,
        &wallet.id,
        STATUS_COMPLETED,
        TxnSpec {
            kind: KIND_WITHDRAWAL_FAILED,
            gross_cents: amount,
            fee_cents: 0,
            net_cents: amount,
            booking_id: None,
            payout_id: txn.payout_id.as_deref(),
            note: Some(note),
        },
    )
    .await?;
    Ok(reversal_id)
}

pub async fn list_txns(
    pool: &PgPool,
    state: &AppState,
    user_id: &str,
    limit: i64,
    offset: i64,
    kind: Option<&str>,
) -> Result<Vec<TxnItem>, SettlementError> {
    let Some(wallet) = find_wallet(pool, state, user_id).await? else {
        return Ok(Vec::new());
    };

    let txns = state.table("wallet_txns");
    let rows = if let Some(kind) = kind {
        sqlx::query(&format!(
            "SELECT id,kind,gross_cents,fee_cents,net_cents,status,booking_id,payout_id,created_at \
             FROM {txns} WHERE wallet_id=$1 AND kind=$2 ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(&wallet.id)
        .bind(kind)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query(&format!(
            "SELECT id,kind,gross_cents,fee_cents,net_cents,status,booking_id,payout_id,created_at \
             FROM {txns} WHERE wallet_id=$1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(&wallet.id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }
    .map_err(|e| SettlementError::from_db("txn list", e))?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(TxnItem {
            id: r.try_get("id").unwrap_or_default(),
            kind: r.try_get("kind").unwrap_or_default(),
            gross_cents: r.try_get("gross_cents").unwrap_or(0),
            fee_cents: r.try_get("fee_cents").unwrap_or(0),
            net_cents: r.try_get("net_cents").unwrap_or(0),
            status: r.try_get("status").unwrap_or_default(),
            booking_id: r.try_get("booking_id").unwrap_or(None),
            payout_id: r.try_get("payout_id").unwrap_or(None),
            created_at: r.try_get("created_at").unwrap_or(None),
        });
    }
    Ok(out)
}

/// The platform fee wallet must exist before the first settlement lands.
pub async fn ensure_platform_wallet(state: &AppState) -> Result<(), SettlementError> {
    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| SettlementError::from_db("platform wallet begin", e))?;
    let _ = ensure_wallet(&mut tx, state, &state.platform_wallet_user_id).await?;
    tx.commit()
        .await
        .map_err(|e| SettlementError::from_db("platform wallet commit", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_constants_are_distinct() {
        let kinds = [
            KIND_RIDE_EARNING,
            KIND_RIDE_PAYMENT,
            KIND_WITHDRAWAL,
            KIND_WITHDRAWAL_FAILED,
            KIND_REFUND,
            KIND_BONUS,
            KIND_PLATFORM_FEE,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in kinds.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn lock_order_is_ascending_regardless_of_input_order() {
        let ids = ["user-c", "user-a", "user-b"];
        let mut order: Vec<usize> = (0..ids.len()).collect();
        order.sort_by_key(|&i| ids[i]);
        let sorted: Vec<&str> = order.iter().map(|&i| ids[i]).collect();
        assert_eq!(sorted, vec!["user-a", "user-b", "user-c"]);
    }
}
