use chrono::{Duration, Utc};
use futures_util::future::try_join_all;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{self, InsertOutcome, JobStatus, JobStoreError, ProcessingUpdate};
use crate::mailer::confirmation_email;
use crate::models::{Job, NewJob, NewJobClaim};
use crate::payments::{CompletedCheckout, PaymentError};
use crate::state::{AppState, PgPooledConnection};
use crate::storage::{fetchable_url, upload_key};
use crate::trigger::TriggerError;

/// Stored on the job when the stylization function could not be started.
pub const PROCESSING_START_FAILED: &str =
    "We could not start processing your images. Our team has been notified.";

const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Created { job_id: String, execution_ref: String },
    Duplicate { job_id: String },
    Unpaid { payment_status: String },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("payment verification failed: {0}")]
    Payment(#[from] PaymentError),
    #[error("failed to resolve upload url: {0:#}")]
    Storage(anyhow::Error),
    #[error("processing trigger failed: {0}")]
    Trigger(#[from] TriggerError),
    #[error("could not allocate a unique job id")]
    IdExhausted,
}

fn connection(state: &AppState) -> Result<PgPooledConnection, LifecycleError> {
    state
        .pool
        .get()
        .map_err(|err| LifecycleError::Pool(err.to_string()))
}

/// Creates and starts the job for a completed checkout, at most once per payment session.
///
/// Redelivered notifications return [`PaymentOutcome::Duplicate`]; for jobs that already
/// finished only the payment bookkeeping is refreshed.
pub async fn handle_payment_completed(
    state: &AppState,
    checkout: &CompletedCheckout,
) -> Result<PaymentOutcome, LifecycleError> {
    let session_id = checkout.session_id.as_str();

    let existing = {
        let mut conn = connection(state)?;
        jobs::find_job_by_session(&mut conn, session_id)?
    };
    if let Some(job) = existing {
        return duplicate(state, checkout, job);
    }

    let intent = state
        .payments
        .retrieve_payment_intent(&checkout.payment_intent_id)
        .await?;
    if !intent.is_succeeded() {
        tracing::warn!(
            session_id,
            payment_intent_id = %intent.id,
            intent_status = %intent.status,
            "payment not settled, skipping job creation"
        );
        return Ok(PaymentOutcome::Unpaid {
            payment_status: intent.status,
        });
    }

    let public_base = state.config.s3_public_base_url.as_deref();
    let image_urls = try_join_all(checkout.file_ids.iter().map(|file_id| {
        let key = upload_key(file_id);
        async move { fetchable_url(state.storage.as_ref(), public_base, &key).await }
    }))
    .await
    .map_err(LifecycleError::Storage)?;

    let job = match insert_with_fresh_id(state, checkout, image_urls)? {
        Some(job) => job,
        None => {
            let mut conn = connection(state)?;
            let job = jobs::find_job_by_session(&mut conn, session_id)?
                .ok_or(JobStoreError::NotFound)?;
            tracing::info!(session_id, job_id = %job.id, "lost creation race, job already exists");
            return Ok(PaymentOutcome::Duplicate { job_id: job.id });
        }
    };
    tracing::info!(
        session_id,
        job_id = %job.id,
        images = job.input_image_refs.len(),
        style = %job.selected_style,
        "created job"
    );
    state.events.publish(&job.id, JobStatus::Queuing);

    let execution_ref = match state
        .trigger
        .trigger(&job.id, &job.input_image_refs, &job.selected_style)
        .await
    {
        Ok(execution_ref) => execution_ref,
        Err(err) => {
            tracing::error!(job_id = %job.id, error = %err, "failed to start processing");
            let mut conn = connection(state)?;
            if jobs::mark_failed(&mut conn, &job.id, PROCESSING_START_FAILED)? {
                state.events.publish(&job.id, JobStatus::Failed);
            }
            return Err(err.into());
        }
    };

    {
        let mut conn = connection(state)?;
        jobs::record_execution(&mut conn, &job.id, &execution_ref)?;
    }

    let link = state.config.job_page_url(&job.id);
    let email = confirmation_email(&job.customer_email, job.customer_name.as_deref(), &link);
    if let Err(err) = state.mailer.send(&email).await {
        tracing::warn!(job_id = %job.id, error = %format!("{err:#}"), "confirmation email failed");
    }

    Ok(PaymentOutcome::Created {
        job_id: job.id,
        execution_ref,
    })
}

fn duplicate(
    state: &AppState,
    checkout: &CompletedCheckout,
    job: Job,
) -> Result<PaymentOutcome, LifecycleError> {
    if jobs::status_of(&job)?.is_terminal() {
        let mut conn = connection(state)?;
        jobs::update_payment_bookkeeping(
            &mut conn,
            &job.id,
            &checkout.payment_intent_id,
            &checkout.payment_status,
        )?;
    }
    tracing::info!(
        session_id = %checkout.session_id,
        job_id = %job.id,
        status = %job.status,
        "duplicate payment notification"
    );
    Ok(PaymentOutcome::Duplicate { job_id: job.id })
}

/// `Ok(None)` when a concurrent delivery created the job first.
fn insert_with_fresh_id(
    state: &AppState,
    checkout: &CompletedCheckout,
    image_urls: Vec<String>,
) -> Result<Option<Job>, LifecycleError> {
    let claim_expires_at =
        Utc::now().naive_utc() + Duration::hours(state.config.claim_token_expiry_hours);
    let mut conn = connection(state)?;

    for _ in 0..MAX_ID_ATTEMPTS {
        let job_id = jobs::derive_job_id(&checkout.customer_email);
        let new_job = NewJob {
            id: job_id.clone(),
            payment_session_id: checkout.session_id.clone(),
            payment_intent_id: checkout.payment_intent_id.clone(),
            customer_email: checkout.customer_email.clone(),
            customer_name: checkout.customer_name.clone(),
            status: JobStatus::Queuing.as_str().to_string(),
            payment_status: checkout.payment_status.clone(),
            selected_style: checkout.selected_style.clone(),
            input_image_refs: image_urls.clone(),
            amount_total: checkout.amount_total,
            currency: checkout.currency.clone(),
        };
        let claim = checkout
            .claim_token_hash
            .as_ref()
            .map(|token_hash| NewJobClaim {
                id: Uuid::new_v4(),
                job_id: job_id.clone(),
                token_hash: token_hash.clone(),
                expires_at: claim_expires_at,
            });

        match jobs::insert_job(&mut conn, &new_job, claim.as_ref())? {
            InsertOutcome::Created(job) => return Ok(Some(job)),
            InsertOutcome::DuplicateSession => return Ok(None),
            InsertOutcome::IdTaken => {
                tracing::debug!(job_id = %job_id, "job id collision, regenerating");
            }
        }
    }

    Err(LifecycleError::IdExhausted)
}

/// Applies a status report from the stylization function and notifies push subscribers.
pub fn record_processing_update(
    state: &AppState,
    job_id: &str,
    update: &ProcessingUpdate,
) -> Result<Job, LifecycleError> {
    let job = {
        let mut conn = connection(state)?;
        jobs::apply_processing_update(&mut conn, job_id, update)?
    };
    tracing::info!(
        job_id,
        status = %job.status,
        progress = job.progress,
        outputs = job.output_image_refs.len(),
        "applied processing update"
    );
    state.events.publish(job_id, update.status);
    Ok(job)
}
