use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Job, NewJob, NewJobClaim};
use crate::schema::{job_claims, jobs};

pub const SUPPORTED_STYLES: &[&str] = &["lunora"];

const SESSION_UNIQUE_CONSTRAINT: &str = "jobs_payment_session_id_key";
const JOB_ID_SUFFIX_LEN: usize = 8;
const JOB_ID_PREFIX_MAX: usize = 24;

pub fn is_supported_style(style: &str) -> bool {
    SUPPORTED_STYLES.iter().any(|allowed| *allowed == style)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queuing,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queuing => "queuing",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "queuing" => Some(JobStatus::Queuing),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queuing => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }

    /// Forward-only. `processing -> processing` is allowed so progress can be reported.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || (self == JobStatus::Processing && next == self)
    }
}

pub const TERMINAL_STATUSES: &[&str] = &["completed", "failed"];

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("job not found")]
    NotFound,
    #[error("job {job_id} has unknown status {status}")]
    UnknownStatus { job_id: String, status: String },
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("completed jobs require at least one output image")]
    MissingOutputs,
    #[error("failed jobs require an error message")]
    MissingErrorMessage,
    #[error("progress must be between 0 and 100")]
    InvalidProgress,
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

pub fn status_of(job: &Job) -> JobStoreResult<JobStatus> {
    JobStatus::parse(&job.status).ok_or_else(|| JobStoreError::UnknownStatus {
        job_id: job.id.clone(),
        status: job.status.clone(),
    })
}

/// `<email local-part slug>-<random suffix>`, e.g. `jane-doe-k3v9x0qa`.
pub fn derive_job_id(customer_email: &str) -> String {
    let local_part = customer_email.split('@').next().unwrap_or_default();
    let mut prefix = String::with_capacity(JOB_ID_PREFIX_MAX);
    for ch in local_part.chars() {
        if prefix.len() >= JOB_ID_PREFIX_MAX {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            prefix.push(ch.to_ascii_lowercase());
        } else if !prefix.is_empty() && !prefix.ends_with('-') {
            prefix.push('-');
        }
    }
    let prefix = prefix.trim_end_matches('-');
    let prefix = if prefix.is_empty() { "job" } else { prefix };

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_SUFFIX_LEN)
        .map(|byte| (byte as char).to_ascii_lowercase())
        .collect();

    format!("{prefix}-{suffix}")
}

pub fn find_job(conn: &mut PgConnection, job_id: &str) -> QueryResult<Option<Job>> {
    jobs::table.find(job_id).first(conn).optional()
}

pub fn find_job_by_session(conn: &mut PgConnection, session_id: &str) -> QueryResult<Option<Job>> {
    jobs::table
        .filter(jobs::payment_session_id.eq(session_id))
        .order(jobs::created_at.desc())
        .first(conn)
        .optional()
}

#[derive(Debug)]
pub enum InsertOutcome {
    Created(Job),
    /// Another delivery already created the job for this payment session.
    DuplicateSession,
    /// The generated primary key collided; the caller should pick a new id.
    IdTaken,
}

/// Inserts the job and its claim token atomically.
///
/// The unique index on `payment_session_id` is the authoritative idempotency guard;
/// a violation of it is reported as [`InsertOutcome::DuplicateSession`].
pub fn insert_job(
    conn: &mut PgConnection,
    new_job: &NewJob,
    claim: Option<&NewJobClaim>,
) -> JobStoreResult<InsertOutcome> {
    let result = conn.transaction::<Job, DieselError, _>(|conn| {
        diesel::insert_into(jobs::table)
            .values(new_job)
            .execute(conn)?;
        if let Some(claim) = claim {
            diesel::insert_into(job_claims::table)
                .values(claim)
                .execute(conn)?;
        }
        jobs::table.find(&new_job.id).first(conn)
    });

    match result {
        Ok(job) => Ok(InsertOutcome::Created(job)),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
            if info.constraint_name() == Some(SESSION_UNIQUE_CONSTRAINT) {
                Ok(InsertOutcome::DuplicateSession)
            } else {
                Ok(InsertOutcome::IdTaken)
            }
        }
        Err(err) => Err(err.into()),
    }
}

pub fn record_execution(
    conn: &mut PgConnection,
    job_id: &str,
    execution_ref: &str,
) -> QueryResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::processing_execution_ref.eq(Some(execution_ref)),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Moves a non-terminal job to `failed`. Returns whether a row changed.
pub fn mark_failed(conn: &mut PgConnection, job_id: &str, error_message: &str) -> QueryResult<bool> {
    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        jobs::table
            .find(job_id)
            .filter(jobs::status.ne_all(TERMINAL_STATUSES.iter().copied())),
    )
    .set((
        jobs::status.eq(JobStatus::Failed.as_str()),
        jobs::error_message.eq(Some(error_message)),
        jobs::completed_at.eq(Some(now)),
        jobs::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(updated > 0)
}

/// Payment bookkeeping for redelivered notifications of jobs already finished.
pub fn update_payment_bookkeeping(
    conn: &mut PgConnection,
    job_id: &str,
    payment_intent_id: &str,
    payment_status: &str,
) -> QueryResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::payment_intent_id.eq(payment_intent_id),
            jobs::payment_status.eq(payment_status),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingUpdate {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub output_image_urls: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ProcessingUpdate {
    fn validate(&self) -> JobStoreResult<()> {
        if let Some(progress) = self.progress {
            if !(0..=100).contains(&progress) {
                return Err(JobStoreError::InvalidProgress);
            }
        }
        match self.status {
            JobStatus::Completed if self.cleaned_outputs().is_empty() => {
                Err(JobStoreError::MissingOutputs)
            }
            JobStatus::Failed if self.cleaned_error().is_none() => {
                Err(JobStoreError::MissingErrorMessage)
            }
            _ => Ok(()),
        }
    }

    fn cleaned_outputs(&self) -> Vec<String> {
        self.output_image_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn cleaned_error(&self) -> Option<String> {
        self.error_message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = jobs)]
struct ProcessingChangeset {
    status: String,
    progress: Option<i32>,
    output_image_refs: Option<Vec<String>>,
    error_message: Option<String>,
    completed_at: Option<NaiveDateTime>,
    updated_at: NaiveDateTime,
}

/// The only write-path for the out-of-process stylization function.
///
/// Locks the row, checks the transition is forward-only and that terminal
/// states carry their required fields, then writes the disjoint field set the
/// function owns.
pub fn apply_processing_update(
    conn: &mut PgConnection,
    job_id: &str,
    update: &ProcessingUpdate,
) -> JobStoreResult<Job> {
    update.validate()?;

    conn.transaction::<Job, JobStoreError, _>(|conn| {
        let job: Job = jobs::table
            .find(job_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(JobStoreError::NotFound)?;

        let current = status_of(&job)?;
        if !current.can_transition_to(update.status) {
            return Err(JobStoreError::InvalidTransition {
                from: current.as_str(),
                to: update.status.as_str(),
            });
        }

        let now = Utc::now().naive_utc();
        let changes = match update.status {
            JobStatus::Completed => ProcessingChangeset {
                status: JobStatus::Completed.as_str().to_string(),
                progress: Some(100),
                output_image_refs: Some(update.cleaned_outputs()),
                error_message: None,
                completed_at: Some(now),
                updated_at: now,
            },
            JobStatus::Failed => ProcessingChangeset {
                status: JobStatus::Failed.as_str().to_string(),
                progress: None,
                output_image_refs: None,
                error_message: update.cleaned_error(),
                completed_at: Some(now),
                updated_at: now,
            },
            other => ProcessingChangeset {
                status: other.as_str().to_string(),
                progress: update.progress,
                output_image_refs: None,
                error_message: None,
                completed_at: None,
                updated_at: now,
            },
        };

        diesel::update(jobs::table.find(job_id))
            .set(&changes)
            .execute(conn)?;

        Ok(jobs::table.find(job_id).first(conn)?)
    })
}

pub fn mark_downloaded(conn: &mut PgConnection, job_id: &str) -> QueryResult<bool> {
    let updated = diesel::update(jobs::table.find(job_id))
        .set((
            jobs::is_downloaded.eq(true),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(updated > 0)
}

/// Non-terminal jobs untouched since `cutoff`, oldest first.
pub fn list_stalled(conn: &mut PgConnection, cutoff: NaiveDateTime) -> QueryResult<Vec<Job>> {
    jobs::table
        .filter(jobs::status.ne_all(TERMINAL_STATUSES.iter().copied()))
        .filter(jobs::updated_at.lt(cutoff))
        .order(jobs::updated_at.asc())
        .load(conn)
}
