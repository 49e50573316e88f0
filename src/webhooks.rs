use crate::error::{ApiError, ApiResult};
use crate::gateway::{self, CardEvent, EventOutcome, PayoutEvent, SignatureError};
use crate::idempotency::{self, MarkOutcome};
use crate::settlement::{self, CardApplication};
use crate::state::AppState;
use crate::withdrawals::{self, PayoutApplication};
use crate::models::WebhookAck;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;

fn verify(
    state: &AppState,
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiResult<()> {
    let Some(secret) = secret else {
        tracing::error!("webhook received but no webhook secret configured");
        return Err(ApiError::internal("webhook secret not configured"));
    };
    let header = headers
        .get(gateway::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing signature"))?;

    gateway::verify_signature(
        body,
        header,
        secret,
        state.webhook_tolerance_secs,
        Utc::now().timestamp(),
    )
    .map_err(|e| match e {
        SignatureError::Mismatch => ApiError::unauthorized("invalid signature"),
        SignatureError::Expired => ApiError::bad_request("signature timestamp outside tolerance"),
        SignatureError::Malformed => ApiError::bad_request("malformed signature header"),
    })
}

/// Card-gateway webhook. The idempotency record and the ledger mutation
/// commit together; any internal failure rolls both back and answers non-2xx
/// so the gateway's retry delivers the event again.
pub async fn card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<axum::Json<WebhookAck>> {
    verify(&state, state.card_webhook_secret.as_deref(), &headers, &body)?;

    let evt: CardEvent = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("malformed webhook payload"))?;
    if !idempotency::valid_event_id(&evt.event_id) {
        return Err(ApiError::bad_request("invalid event_id"));
    }
    let outcome = EventOutcome::from_event(&evt.event_type, evt.outcome.as_deref());

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin card webhook failed");
        ApiError::internal("database error")
    })?;

    if outcome == EventOutcome::Unknown {
        tracing::info!(event_id = %evt.event_id, event_type = %evt.event_type, "ignoring unknown card event");
        let mark = idempotency::mark_processed(
            &mut tx,
            &state,
            &evt.event_id,
            &evt.event_type,
            idempotency::RESULT_SKIPPED,
            Some(&evt.intent_id),
        )
        .await
        .map_err(ApiError::from)?;
        if mark == MarkOutcome::Recorded {
            tx.commit().await.map_err(|e| {
                tracing::error!(error = %e, "db commit card webhook failed");
                ApiError::internal("database error")
            })?;
        }
        return Ok(axum::Json(WebhookAck {
            event_id: evt.event_id,
            result: idempotency::RESULT_SKIPPED,
        }));
    }

    let metadata = format!("intent={};outcome={}", evt.intent_id, outcome.as_str());
    let mark = idempotency::mark_processed(
        &mut tx,
        &state,
        &evt.event_id,
        &evt.event_type,
        idempotency::RESULT_SUCCESS,
        Some(&metadata),
    )
    .await
    .map_err(ApiError::from)?;
    if mark == MarkOutcome::Duplicate {
        tracing::info!(event_id = %evt.event_id, "duplicate card event");
        return Ok(axum::Json(WebhookAck {
            event_id: evt.event_id,
            result: idempotency::RESULT_SKIPPED,
        }));
    }

    let applied = settlement::apply_card_outcome(&mut tx, &state, &evt.intent_id, outcome)
        .await
        .map_err(ApiError::from)?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit card webhook failed");
        ApiError::internal("database error")
    })?;

    let result = match applied {
        CardApplication::Applied => idempotency::RESULT_SUCCESS,
        CardApplication::AlreadyFinal => idempotency::RESULT_SKIPPED,
    };
    Ok(axum::Json(WebhookAck {
        event_id: evt.event_id,
        result,
    }))
}

/// Payout-processor webhook; same idempotency discipline as the card path.
pub async fn payout_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<axum::Json<WebhookAck>> {
    verify(
        &state,
        state.payout_webhook_secret.as_deref(),
        &headers,
        &body,
    )?;

    let evt: PayoutEvent = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("malformed webhook payload"))?;
    if !idempotency::valid_event_id(&evt.event_id) {
        return Err(ApiError::bad_request("invalid event_id"));
    }
    let outcome = EventOutcome::from_event(&evt.event_type, evt.outcome.as_deref());

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin payout webhook failed");
        ApiError::internal("database error")
    })?;

    if outcome == EventOutcome::Unknown {
        tracing::info!(event_id = %evt.event_id, event_type = %evt.event_type, "ignoring unknown payout event");
        let mark = idempotency::mark_processed(
            &mut tx,
            &state,
            &evt.event_id,
            &evt.event_type,
            idempotency::RESULT_SKIPPED,
            Some(&evt.payout_id),
        )
        .await
        .map_err(ApiError::from)?;
        if mark == MarkOutcome::Recorded {
            tx.commit().await.map_err(|e| {
                tracing::error!(error = %e, "db commit payout webhook failed");
                ApiError::internal("database error")
            })?;
        }
        return Ok(axum::Json(WebhookAck {
            event_id: evt.event_id,
            result: idempotency::RESULT_SKIPPED,
        }));
    }

    let metadata = format!("payout={};outcome={}", evt.payout_id, outcome.as_str());
    let mark = idempotency::mark_processed(
        &mut tx,
        &state,
        &evt.event_id,
        &evt.event_type,
        idempotency::RESULT_SUCCESS,
        Some(&metadata),
    )
    .await
    .map_err(ApiError::from)?;
    if mark == MarkOutcome::Duplicate {
        tracing::info!(event_id = %evt.event_id, "duplicate payout event");
        return Ok(axum::Json(WebhookAck {
            event_id: evt.event_id,
            result: idempotency::RESULT_SKIPPED,
        }));
    }

    let applied = withdrawals::apply_payout_outcome(&mut tx, &state, &evt.payout_id, outcome)
        .await
        .map_err(ApiError::from)?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit payout webhook failed");
        ApiError::internal("database error")
    })?;

    let result = match applied {
        PayoutApplication::Applied => idempotency::RESULT_SUCCESS,
        PayoutApplication::AlreadyFinal => idempotency::RESULT_SKIPPED,
    };
    Ok(axum::Json(WebhookAck {
        event_id: evt.event_id,
        result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_event_parses_without_outcome_field() {
        let raw = br#"{"event_id":"evt_1","event_type":"payment_intent.succeeded","intent_id":"pi_1"}"#;
        let evt: CardEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(evt.event_id, "evt_1");
        assert!(evt.outcome.is_none());
        assert_eq!(
            EventOutcome::from_event(&evt.event_type, evt.outcome.as_deref()),
            EventOutcome::Succeeded
        );
    }

    #[test]
    fn payout_event_with_explicit_outcome() {
        let raw =
            br#"{"event_id":"evt_2","event_type":"payout.updated","payout_id":"po_1","outcome":"failed"}"#;
        let evt: PayoutEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(
            EventOutcome::from_event(&evt.event_type, evt.outcome.as_deref()),
            EventOutcome::Failed
        );
    }

    #[test]
    fn unrecognized_event_type_is_contained_as_unknown() {
        let raw = br#"{"event_id":"evt_3","event_type":"account.updated","intent_id":"pi_9"}"#;
        let evt: CardEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(
            EventOutcome::from_event(&evt.event_type, evt.outcome.as_deref()),
            EventOutcome::Unknown
        );
    }

    #[test]
    fn missing_required_fields_fail_parsing() {
        let raw = br#"{"event_id":"evt_4","event_type":"payment_intent.succeeded"}"#;
        assert!(serde_json::from_slice::<CardEvent>(raw).is_err());
    }
}
