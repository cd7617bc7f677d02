pub mod jwt;
pub mod tokens;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::Serialize;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

/// The browser-held anonymous identity that owns uploads and receives read grants.
#[derive(Debug, Clone, Serialize)]
pub struct AnonymousUser {
    pub user_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for AnonymousUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state
            .sessions
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        Ok(AnonymousUser {
            user_id: claims.sub,
        })
    }
}

/// Bearer check for the stylization function's status callback.
pub struct ProcessingCallback;

#[async_trait]
impl FromRequestParts<AppState> for ProcessingCallback {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let expected = tokens::hash_claim_token(&state.config.processing_callback_secret);
        if tokens::hash_claim_token(bearer.token()) != expected {
            return Err(AppError::unauthorized());
        }
        Ok(ProcessingCallback)
    }
}
