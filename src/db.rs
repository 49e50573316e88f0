use sqlx::postgres::{PgPool, PgPoolOptions};

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let wallets = table_name(db_schema, "wallets");
    let txns = table_name(db_schema, "wallet_txns");
    let events = table_name(db_schema, "idempotency_events");
    let bookings = table_name(db_schema, "bookings");
    let banks = table_name(db_schema, "bank_accounts");

    let ddls = [
        format!(
            "CREATE TABLE IF NOT EXISTS {wallets} (\
             id VARCHAR(36) PRIMARY KEY,\
             user_id VARCHAR(36) NOT NULL UNIQUE,\
             available_cents BIGINT NOT NULL DEFAULT 0,\
             pending_cents BIGINT NOT NULL DEFAULT 0,\
             currency VARCHAR(3) NOT NULL,\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {txns} (\
             id VARCHAR(36) PRIMARY KEY,\
             wallet_id VARCHAR(36) NOT NULL,\
             kind VARCHAR(32) NOT NULL,\
             gross_cents BIGINT NOT NULL,\
             fee_cents BIGINT NOT NULL DEFAULT 0,\
             net_cents BIGINT NOT NULL,\
             status VARCHAR(16) NOT NULL,\
             booking_id VARCHAR(36),\
             payout_id VARCHAR(64),\
             note VARCHAR(255),\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {events} (\
             event_id VARCHAR(128) PRIMARY KEY,\
             event_type VARCHAR(64) NOT NULL,\
             result VARCHAR(16) NOT NULL,\
             error_message VARCHAR(255),\
             metadata TEXT,\
             processed_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {bookings} (\
             id VARCHAR(36) PRIMARY KEY,\
             offer_id VARCHAR(36) NOT NULL,\
             payer_user_id VARCHAR(36) NOT NULL,\
             payee_user_id VARCHAR(36) NOT NULL,\
             price_per_seat_cents BIGINT NOT NULL,\
             seats INTEGER NOT NULL,\
             status VARCHAR(24) NOT NULL,\
             payment_method VARCHAR(8),\
             payment_intent_id VARCHAR(64),\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {banks} (\
             user_id VARCHAR(36) PRIMARY KEY,\
             bank_name VARCHAR(64),\
             iban_masked VARCHAR(64),\
             payout_account_id VARCHAR(64),\
             verified BOOLEAN NOT NULL DEFAULT FALSE,\
             created_at TEXT NOT NULL,\
             verified_at TEXT\
             )"
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_user_id ON {wallets}(user_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_txns_wallet ON {txns}(wallet_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_txns_created ON {txns}(created_at)"),
        format!("CREATE INDEX IF NOT EXISTS idx_txns_booking ON {txns}(booking_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_txns_payout ON {txns}(payout_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_events_processed_at ON {events}(processed_at)"),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_intent ON {bookings}(payment_intent_id) WHERE payment_intent_id IS NOT NULL"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_bookings_payer ON {bookings}(payer_user_id)"),
    ];

    for ddl in ddls {
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    // Columns added after the first deployed schema version.
    let _ = sqlx::query(&format!(
        "ALTER TABLE {txns} ADD COLUMN IF NOT EXISTS payout_id VARCHAR(64)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {txns} ADD COLUMN IF NOT EXISTS note VARCHAR(255)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {banks} ADD COLUMN IF NOT EXISTS payout_account_id VARCHAR(64)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {bookings} ADD COLUMN IF NOT EXISTS payment_intent_id VARCHAR(64)"
    ))
    .execute(pool)
    .await;

    Ok(())
}
