use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::{error::AppResult, state::AppState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousSessionResponse {
    pub user_id: Uuid,
    pub token: String,
    pub expires_in: i64,
}

pub async fn create_anonymous_session(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<AnonymousSessionResponse>)> {
    let issued = state.sessions.issue_anonymous()?;
    tracing::debug!(user_id = %issued.user_id, "issued anonymous session");
    Ok((
        StatusCode::CREATED,
        Json(AnonymousSessionResponse {
            user_id: issued.user_id,
            token: issued.token,
            expires_in: issued.expires_in,
        }),
    ))
}
