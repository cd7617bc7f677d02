use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    error::{AppError, AppResult},
    lifecycle::{self, PaymentOutcome},
    payments::{
        signature::{verify_signature, SIGNATURE_HEADER},
        CompletedCheckout, CHECKOUT_COMPLETED_EVENTS,
    },
    state::AppState,
};

#[derive(Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookEventData,
}

#[derive(Deserialize)]
struct WebhookEventData {
    object: Value,
}

/// Payment notifications. The signature is checked before anything else is read.
///
/// Internal failures answer 500 so the gateway redelivers; redelivery is safe
/// because job creation is idempotent per payment session.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing webhook signature"))?;

    if let Err(err) = verify_signature(
        &body,
        signature,
        &state.config.stripe_webhook_secret,
        state.config.stripe_webhook_tolerance_seconds,
        Utc::now().timestamp(),
    ) {
        warn!(error = %err, "rejected webhook with invalid signature");
        return Err(AppError::bad_request("invalid webhook signature"));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|_| AppError::bad_request("malformed webhook event"))?;

    if !CHECKOUT_COMPLETED_EVENTS.contains(&event.event_type.as_str()) {
        info!(event_id = %event.id, event_type = %event.event_type, "ignoring webhook event");
        return Ok(Json(json!({ "received": true })));
    }

    let checkout = CompletedCheckout::from_event_object(&event.data.object).map_err(|err| {
        warn!(event_id = %event.id, error = %err, "unusable checkout event");
        AppError::bad_request(format!("invalid checkout session: {err}"))
    })?;

    match lifecycle::handle_payment_completed(&state, &checkout).await {
        Ok(outcome) => {
            let (result, job_id) = match &outcome {
                PaymentOutcome::Created { job_id, .. } => ("created", Some(job_id.as_str())),
                PaymentOutcome::Duplicate { job_id } => ("duplicate", Some(job_id.as_str())),
                PaymentOutcome::Unpaid { .. } => ("unpaid", None),
            };
            info!(
                event_id = %event.id,
                session_id = %checkout.session_id,
                job_id = job_id.unwrap_or("-"),
                result,
                "handled checkout completion"
            );
            Ok(Json(json!({ "received": true, "result": result, "jobId": job_id })))
        }
        Err(err) => {
            error!(
                event_id = %event.id,
                session_id = %checkout.session_id,
                error = %err,
                "checkout completion handling failed"
            );
            Err(AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "webhook handling failed",
            ))
        }
    }
}
