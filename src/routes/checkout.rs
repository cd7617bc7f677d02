use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    auth::{tokens, AnonymousUser},
    error::{AppError, AppResult},
    jobs::{is_supported_style, SUPPORTED_STYLES},
    payments::{metadata_keys, CheckoutRequest},
    pricing,
    schema::uploads,
    state::AppState,
};

/// Gateway limit on a single metadata value.
const METADATA_VALUE_MAX: usize = 500;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub style: String,
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutResponse {
    pub session_id: String,
    pub url: String,
    /// Shown once; exchanged later for read access to the job.
    pub claim_token: String,
    pub amount_total: i64,
    pub currency: String,
}

fn dedupe_file_ids(file_ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(file_ids.len());
    for id in file_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        if !unique.iter().any(|existing| existing == id) {
            unique.push(id.to_string());
        }
    }
    unique
}

pub async fn create_checkout(
    State(state): State<AppState>,
    user: AnonymousUser,
    Json(payload): Json<CreateCheckoutRequest>,
) -> AppResult<(StatusCode, Json<CreateCheckoutResponse>)> {
    if !is_supported_style(&payload.style) {
        return Err(AppError::bad_request(format!(
            "unsupported style, expected one of: {}",
            SUPPORTED_STYLES.join(", ")
        )));
    }

    let file_ids = dedupe_file_ids(&payload.file_ids);
    let quote = pricing::quote(file_ids.len()).ok_or_else(|| {
        AppError::bad_request(format!(
            "between 1 and {} images are required",
            pricing::MAX_IMAGES_PER_ORDER
        ))
    })?;

    let customer_email = payload
        .customer_email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty());
    if let Some(email) = customer_email {
        if !email.contains('@') {
            return Err(AppError::bad_request("customerEmail is not a valid address"));
        }
    }

    let owned: i64 = {
        let mut conn = state.db()?;
        uploads::table
            .filter(uploads::file_id.eq_any(&file_ids))
            .filter(uploads::owner_id.eq(user.user_id))
            .count()
            .get_result(&mut conn)?
    };
    if owned != file_ids.len() as i64 {
        return Err(AppError::forbidden());
    }

    let encoded_file_ids = serde_json::to_string(&file_ids)?;
    if encoded_file_ids.len() > METADATA_VALUE_MAX {
        return Err(AppError::bad_request("too many files for a single order"));
    }

    let claim_token = tokens::generate_claim_token();
    let mut metadata = BTreeMap::new();
    metadata.insert(metadata_keys::SELECTED_STYLE.to_string(), payload.style.clone());
    metadata.insert(metadata_keys::FILE_IDS.to_string(), encoded_file_ids);
    metadata.insert(
        metadata_keys::CLAIM_TOKEN_HASH.to_string(),
        tokens::hash_claim_token(&claim_token),
    );

    let base = &state.config.public_base_url;
    let request = CheckoutRequest {
        amount_cents: quote.total_cents,
        currency: state.config.checkout_currency.clone(),
        product_name: format!("Styllio {} stylization", payload.style),
        description: format!(
            "{} image(s) at {}.{:02} each",
            quote.image_count,
            quote.unit_price_cents / 100,
            quote.unit_price_cents % 100
        ),
        success_url: format!("{base}/success?session_id={{CHECKOUT_SESSION_ID}}"),
        cancel_url: format!("{base}/failure"),
        customer_email: customer_email.map(str::to_string),
        metadata,
    };

    let session = state
        .payments
        .create_checkout_session(&request)
        .await
        .map_err(|err| {
            error!(error = %err, owner_id = %user.user_id, "failed to create checkout session");
            AppError::new(StatusCode::BAD_GATEWAY, "payment provider unavailable")
        })?;
    let url = session
        .url
        .ok_or_else(|| AppError::internal("checkout session has no redirect url"))?;

    info!(
        session_id = %session.id,
        owner_id = %user.user_id,
        images = quote.image_count,
        amount_total = quote.total_cents,
        "checkout session created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateCheckoutResponse {
            session_id: session.id,
            url,
            claim_token,
            amount_total: quote.total_cents,
            currency: request.currency,
        }),
    ))
}
