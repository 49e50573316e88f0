use crate::error::SettlementError;
use crate::state::AppState;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_SKIPPED: &str = "skipped";

const MAX_EVENT_ID_LEN: usize = 128;

/// Outcome of the atomic insert-or-detect-duplicate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First time this event id was seen; the record is part of the open
    /// transaction and commits (or rolls back) with it.
    Recorded,
    /// Another delivery already recorded this event id. Not an error.
    Duplicate,
}

pub fn valid_event_id(event_id: &str) -> bool {
    let e = event_id.trim();
    !e.is_empty() && e.len() <= MAX_EVENT_ID_LEN
}

/// Record an external event inside the caller's transaction.
///
/// Single atomic create-if-absent against the primary key on `event_id`; a
/// conflicting insert is the duplicate signal, there is no read-then-write
/// window. A concurrent delivery of the same event blocks on the uncommitted
/// row and observes the duplicate once the first transaction commits.
pub async fn mark_processed(
    tx: &mut Transaction<'_, Postgres>,
    state: &AppState,
    event_id: &str,
    event_type: &str,
    result: &str,
    metadata: Option<&str>,
) -> Result<MarkOutcome, SettlementError> {
    let events = state.table("idempotency_events");
    let res = sqlx::query(&format!(
        "INSERT INTO {events} (event_id,event_type,result,error_message,metadata,processed_at) \
         VALUES ($1,$2,$3,$4,$5,$6) ON CONFLICT (event_id) DO NOTHING"
    ))
    .bind(event_id)
    .bind(event_type)
    .bind(result)
    .bind(Option::<&str>::None)
    .bind(metadata)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await
    .map_err(|e| SettlementError::from_db("idempotency insert", e))?;

    if res.rows_affected() == 0 {
        Ok(MarkOutcome::Duplicate)
    } else {
        Ok(MarkOutcome::Recorded)
    }
}

pub async fn is_processed(
    pool: &PgPool,
    state: &AppState,
    event_id: &str,
) -> Result<bool, SettlementError> {
    let events = state.table("idempotency_events");
    let row = sqlx::query(&format!(
        "SELECT 1 AS present FROM {events} WHERE event_id=$1 LIMIT 1"
    ))
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| SettlementError::from_db("idempotency lookup", e))?;
    Ok(row.is_some())
}

/// Delete records older than the retention window. The store only exists to
/// suppress duplicates within the external systems' retry horizon, so expired
/// rows are dead weight.
pub async fn purge_expired(
    pool: &PgPool,
    state: &AppState,
    retention_days: i64,
) -> Result<u64, SettlementError> {
    let events = state.table("idempotency_events");
    let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
    let res = sqlx::query(&format!("DELETE FROM {events} WHERE processed_at < $1"))
        .bind(&cutoff)
        .execute(pool)
        .await
        .map_err(|e| SettlementError::from_db("idempotency purge", e))?;
    Ok(res.rows_affected())
}

pub async fn event_result(
    pool: &PgPool,
    state: &AppState,
    event_id: &str,
) -> Result<Option<String>, SettlementError> {
    let events = state.table("idempotency_events");
    let row = sqlx::query(&format!(
        "SELECT result FROM {events} WHERE event_id=$1"
    ))
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| SettlementError::from_db("idempotency result lookup", e))?;
    Ok(row.map(|r| r.try_get("result").unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_validation() {
        assert!(valid_event_id("evt_1"));
        assert!(valid_event_id(&"x".repeat(128)));
        assert!(!valid_event_id(""));
        assert!(!valid_event_id("   "));
        assert!(!valid_event_id(&"x".repeat(129)));
    }
}
