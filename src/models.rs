use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct WalletOut {
    pub wallet_id: Option<String>,
    pub user_id: String,
    pub available_cents: i64,
    pub pending_cents: i64,
    pub minimum_withdrawal_cents: i64,
    pub can_withdraw: bool,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct TxnItem {
    pub id: String,
    pub kind: String,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub status: String,
    pub booking_id: Option<String>,
    pub payout_id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TxnParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptOfferReq {
    pub offer_id: String,
    pub payer_user_id: String,
    pub method: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptOfferOut {
    pub booking_id: String,
    pub status: String,
    pub gross_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalReq {
    pub user_id: String,
    pub amount_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalOut {
    pub txn_id: String,
    pub status: String,
    pub amount_cents: i64,
    pub available_cents: i64,
    pub pending_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct BankStatusOut {
    pub connected: bool,
    pub verified: bool,
    pub bank_name: Option<String>,
    pub iban_masked: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BankUpsertReq {
    pub bank_name: String,
    pub iban_masked: String,
    pub payout_account_id: String,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct BookingRegisterReq {
    pub booking_id: String,
    pub offer_id: String,
    pub payer_user_id: String,
    pub payee_user_id: String,
    pub price_per_seat_cents: i64,
    pub seats: i32,
}

#[derive(Debug, Serialize)]
pub struct BookingOut {
    pub booking_id: String,
    pub offer_id: String,
    pub status: String,
    pub gross_cents: i64,
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BonusReq {
    pub amount_cents: i64,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub result: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
}
