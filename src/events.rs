use futures_util::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::jobs::JobStatus;

const CHANNEL_CAPACITY: usize = 256;

/// A change notification. Subscribers treat it as a hint and re-read the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: String,
    pub status: Option<JobStatus>,
}

/// Process-local fan-out of job changes to push subscribers.
#[derive(Clone)]
pub struct JobEvents {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }
}

impl JobEvents {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, job_id: &str, status: JobStatus) {
        let receivers = self
            .sender
            .send(JobEvent {
                job_id: job_id.to_string(),
                status: Some(status),
            })
            .unwrap_or(0);
        tracing::debug!(job_id, status = status.as_str(), receivers, "published job event");
    }

    /// Changes to one job. A lagging subscriber gets a status-less event so it re-fetches.
    pub fn subscribe(&self, job_id: String) -> impl Stream<Item = JobEvent> + Send + 'static {
        let receiver = self.sender.subscribe();
        stream::unfold((receiver, job_id), |(mut receiver, job_id)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.job_id == job_id => {
                        return Some((event, (receiver, job_id)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %job_id, skipped, "job event subscriber lagged");
                        let event = JobEvent {
                            job_id: job_id.clone(),
                            status: None,
                        };
                        return Some((event, (receiver, job_id)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}
