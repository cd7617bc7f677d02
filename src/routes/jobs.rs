use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{tokens::hash_claim_token, AnonymousUser, ProcessingCallback},
    error::{AppError, AppResult},
    jobs::{self as job_store, JobStoreError, ProcessingUpdate},
    lifecycle::{self, LifecycleError},
    models::{Job, JobClaim, NewJobReader},
    projection::JobView,
    schema::{job_claims, job_readers},
    state::AppState,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLookupQuery {
    pub session_id: Option<String>,
    pub id: Option<String>,
}

fn project(job: &Job) -> AppResult<Json<JobView>> {
    JobView::try_from(job)
        .map(Json)
        .map_err(AppError::internal)
}

/// Lookup by payment session (what a client holds right after checkout) or by id.
pub async fn find_job(
    State(state): State<AppState>,
    Query(query): Query<JobLookupQuery>,
) -> AppResult<Json<JobView>> {
    let session_id = query.session_id.as_deref().map(str::trim).filter(|v| !v.is_empty());
    let job_id = query.id.as_deref().map(str::trim).filter(|v| !v.is_empty());

    let mut conn = state.db()?;
    let job = match (session_id, job_id) {
        (Some(session_id), _) => job_store::find_job_by_session(&mut conn, session_id)?,
        (None, Some(job_id)) => job_store::find_job(&mut conn, job_id)?,
        (None, None) => {
            return Err(AppError::bad_request(
                "either sessionId or id query parameter is required",
            ))
        }
    };
    let job = job.ok_or_else(AppError::not_found)?;
    project(&job)
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobView>> {
    let mut conn = state.db()?;
    let job = job_store::find_job(&mut conn, &job_id)?.ok_or_else(AppError::not_found)?;
    project(&job)
}

/// Server-sent change notifications for one job. Requires a read grant from a claim.
pub async fn job_events(
    State(state): State<AppState>,
    user: AnonymousUser,
    Path(job_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    {
        let mut conn = state.db()?;
        ensure_reader(&mut conn, &job_id, &user)?;
    }

    info!(job_id = %job_id, user_id = %user.user_id, "push subscriber connected");
    let stream = state.events.subscribe(job_id).map(|event| {
        let data = json!({ "jobId": event.job_id, "status": event.status });
        Ok(Event::default().event("job").data(data.to_string()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub claim_token: String,
    pub user_id: Uuid,
}

enum ClaimRejection {
    Invalid,
    Expired,
}

/// Exchanges the one-time checkout claim token for a read grant on the job.
pub async fn claim_job(
    State(state): State<AppState>,
    user: AnonymousUser,
    Path(job_id): Path<String>,
    Json(payload): Json<ClaimRequest>,
) -> AppResult<Json<Value>> {
    if payload.claim_token.trim().is_empty() {
        return Err(AppError::bad_request("missing claim token"));
    }
    if payload.user_id != user.user_id {
        return Err(AppError::forbidden());
    }

    let token_hash = hash_claim_token(payload.claim_token.trim());
    let mut conn = state.db()?;
    let outcome = conn.transaction::<Result<(), ClaimRejection>, diesel::result::Error, _>(|conn| {
        let claim: Option<JobClaim> = job_claims::table
            .filter(job_claims::job_id.eq(&job_id))
            .filter(job_claims::token_hash.eq(&token_hash))
            .filter(job_claims::used_at.is_null())
            .for_update()
            .first(conn)
            .optional()?;
        let Some(claim) = claim else {
            return Ok(Err(ClaimRejection::Invalid));
        };
        let now = Utc::now().naive_utc();
        if claim.expires_at < now {
            return Ok(Err(ClaimRejection::Expired));
        }

        diesel::insert_into(job_readers::table)
            .values(&NewJobReader {
                job_id: job_id.clone(),
                user_id: user.user_id,
            })
            .on_conflict_do_nothing()
            .execute(conn)?;
        diesel::update(job_claims::table.find(claim.id))
            .set(job_claims::used_at.eq(Some(now)))
            .execute(conn)?;
        Ok(Ok(()))
    })?;

    match outcome {
        Ok(()) => {
            info!(job_id = %job_id, user_id = %user.user_id, "job claimed");
            Ok(Json(json!({ "ok": true })))
        }
        Err(ClaimRejection::Invalid) => {
            warn!(job_id = %job_id, "claim rejected: invalid or used token");
            Err(AppError::bad_request("invalid or used token"))
        }
        Err(ClaimRejection::Expired) => {
            warn!(job_id = %job_id, "claim rejected: token expired");
            Err(AppError::bad_request("token expired"))
        }
    }
}

/// 404 for unknown jobs, 403 unless the session redeemed the job's claim token.
fn ensure_reader(conn: &mut PgConnection, job_id: &str, user: &AnonymousUser) -> AppResult<()> {
    if job_store::find_job(conn, job_id)?.is_none() {
        return Err(AppError::not_found());
    }
    let granted: i64 = job_readers::table
        .filter(job_readers::job_id.eq(job_id))
        .filter(job_readers::user_id.eq(user.user_id))
        .count()
        .get_result(conn)?;
    if granted == 0 {
        return Err(AppError::forbidden());
    }
    Ok(())
}

pub async fn mark_downloaded(
    State(state): State<AppState>,
    user: AnonymousUser,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    ensure_reader(&mut conn, &job_id, &user)?;
    job_store::mark_downloaded(&mut conn, &job_id)?;
    info!(job_id = %job_id, user_id = %user.user_id, "job marked downloaded");
    Ok(Json(json!({ "ok": true })))
}

/// Write-back path for the stylization function.
pub async fn processing_status_callback(
    State(state): State<AppState>,
    _caller: ProcessingCallback,
    Path(job_id): Path<String>,
    Json(update): Json<ProcessingUpdate>,
) -> AppResult<Json<JobView>> {
    let job = lifecycle::record_processing_update(&state, &job_id, &update).map_err(|err| {
        if matches!(err, LifecycleError::Store(JobStoreError::InvalidTransition { .. })) {
            warn!(job_id = %job_id, error = %err, "rejected processing update");
        }
        AppError::from(err)
    })?;
    project(&job)
}
