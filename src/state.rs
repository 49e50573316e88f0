use crate::gateway::{CardGatewayClient, PayoutClient};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub db_schema: Option<String>,
    pub env_name: String,
    pub default_currency: String,
    pub driver_share_percent: i64,
    pub minimum_withdrawal_cents: i64,
    pub allow_direct_bonus: bool,
    pub platform_wallet_user_id: String,
    pub require_internal_secret: bool,
    pub internal_secret: Option<String>,
    pub card_gateway: Option<CardGatewayClient>,
    pub payout_gateway: Option<PayoutClient>,
    pub card_webhook_secret: Option<String>,
    pub payout_webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
}

impl AppState {
    pub fn table(&self, name: &str) -> String {
        match &self.db_schema {
            Some(s) => format!("{s}.{name}"),
            None => name.to_string(),
        }
    }
}
