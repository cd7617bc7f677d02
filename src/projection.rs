use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::JobStatus;
use crate::models::Job;

/// The client-facing view of a job, shared by the HTTP API and the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub original_image_urls: Vec<String>,
    #[serde(default)]
    pub processed_images: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: JobViewMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobViewMetadata {
    pub style: String,
    pub image_count: usize,
    pub customer_email: String,
    pub payment_status: String,
}

impl JobView {
    /// Observers stop here: completed with outputs, or failed.
    pub fn is_finished(&self) -> bool {
        match self.status {
            JobStatus::Completed => !self.processed_images.is_empty(),
            JobStatus::Failed => true,
            _ => false,
        }
    }
}

impl TryFrom<&Job> for JobView {
    type Error = crate::jobs::JobStoreError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        let status = crate::jobs::status_of(job)?;
        Ok(Self {
            id: job.id.clone(),
            status,
            progress: Some(job.progress),
            result_url: job.output_image_refs.first().cloned(),
            original_image_urls: job.input_image_refs.clone(),
            processed_images: job.output_image_refs.clone(),
            error: job.error_message.clone(),
            created_at: job.created_at.and_utc(),
            updated_at: job.updated_at.and_utc(),
            completed_at: job.completed_at.map(|at| at.and_utc()),
            metadata: JobViewMetadata {
                style: job.selected_style.clone(),
                image_count: job.input_image_refs.len(),
                customer_email: job.customer_email.clone(),
                payment_status: job.payment_status.clone(),
            },
        })
    }
}
