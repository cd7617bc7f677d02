//! Watches one job from payment session to terminal status.
//!
//! A single task owns every timer and the push subscription. It first resolves
//! the payment session to a job, then listens for push notifications and
//! re-fetches on each one. When push is unavailable or stays silent past the
//! grace window the subscription is dropped and the same task polls instead.
//! Exhausted budgets end in [`ObserverState::StillProcessing`], never an error.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::JobFeed;
use crate::jobs::JobStatus;
use crate::projection::JobView;

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub resolve_attempts: u32,
    pub resolve_interval: Duration,
    pub push_grace: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            resolve_attempts: 10,
            resolve_interval: Duration::from_secs(3),
            push_grace: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5),
            poll_attempts: 360,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverState {
    Resolving { attempt: u32 },
    Watching { job: JobView, via: WatchMode },
    Completed(JobView),
    Failed(JobView),
    /// Budget spent without a terminal status. The job may still finish.
    StillProcessing { job_id: Option<String> },
    Stopped,
}

impl ObserverState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed(_) | Self::StillProcessing { .. } | Self::Stopped
        )
    }
}

enum Start {
    Session(String),
    Job(String),
}

pub struct JobObserver<F> {
    feed: Arc<F>,
    config: ObserverConfig,
}

impl<F: JobFeed> JobObserver<F> {
    pub fn new(feed: Arc<F>, config: ObserverConfig) -> Self {
        Self { feed, config }
    }

    /// Starts from the payment session id a client holds after checkout.
    pub fn spawn_for_session(&self, session_id: String) -> ObserverHandle {
        self.spawn(Start::Session(session_id))
    }

    pub fn spawn_for_job(&self, job_id: String) -> ObserverHandle {
        self.spawn(Start::Job(job_id))
    }

    fn spawn(&self, start: Start) -> ObserverHandle {
        let (state_tx, state_rx) = watch::channel(ObserverState::Resolving { attempt: 0 });
        let (stop_tx, stop_rx) = watch::channel(false);
        let feed = Arc::clone(&self.feed);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = stop_requested(stop_rx) => ObserverState::Stopped,
                outcome = observe(feed.as_ref(), &config, start, &state_tx) => outcome,
            };
            info!(outcome = outcome_label(&outcome), "job observer finished");
            state_tx.send_replace(outcome);
        });

        ObserverHandle {
            state: state_rx,
            stop: stop_tx,
            task: Some(task),
        }
    }
}

/// Owns the observer task. Dropping the handle aborts it.
pub struct ObserverHandle {
    state: watch::Receiver<ObserverState>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    pub fn state(&self) -> ObserverState {
        self.state.borrow().clone()
    }

    /// Receiver for rendering every state change.
    pub fn states(&self) -> watch::Receiver<ObserverState> {
        self.state.clone()
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub async fn finished(mut self) -> ObserverState {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "job observer task ended abnormally");
            }
        }
        self.state.borrow().clone()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn stop_requested(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn outcome_label(state: &ObserverState) -> &'static str {
    match state {
        ObserverState::Completed(_) => "completed",
        ObserverState::Failed(_) => "failed",
        ObserverState::StillProcessing { .. } => "still_processing",
        ObserverState::Stopped => "stopped",
        ObserverState::Resolving { .. } | ObserverState::Watching { .. } => "running",
    }
}

async fn observe<F: JobFeed + ?Sized>(
    feed: &F,
    config: &ObserverConfig,
    start: Start,
    states: &watch::Sender<ObserverState>,
) -> ObserverState {
    let job_id = match start {
        Start::Job(job_id) => job_id,
        Start::Session(session_id) => match resolve(feed, config, &session_id, states).await {
            Some(job) if job.is_finished() => return terminal(job),
            Some(job) => job.id,
            None => {
                info!(session_id = %session_id, "no job for session within resolution budget");
                return ObserverState::StillProcessing { job_id: None };
            }
        },
    };
    watch_job(feed, config, &job_id, states).await
}

async fn resolve<F: JobFeed + ?Sized>(
    feed: &F,
    config: &ObserverConfig,
    session_id: &str,
    states: &watch::Sender<ObserverState>,
) -> Option<JobView> {
    for attempt in 1..=config.resolve_attempts {
        states.send_replace(ObserverState::Resolving { attempt });
        match feed.find_by_session(session_id).await {
            Ok(Some(job)) => {
                debug!(session_id, job_id = %job.id, attempt, "resolved session to job");
                return Some(job);
            }
            Ok(None) => debug!(session_id, attempt, "job not created yet"),
            Err(err) => warn!(session_id, attempt, error = %err, "session lookup failed"),
        }
        if attempt < config.resolve_attempts {
            sleep(config.resolve_interval).await;
        }
    }
    None
}

async fn watch_job<F: JobFeed + ?Sized>(
    feed: &F,
    config: &ObserverConfig,
    job_id: &str,
    states: &watch::Sender<ObserverState>,
) -> ObserverState {
    let deadline = Instant::now() + config.poll_interval * config.poll_attempts;

    match feed.subscribe(job_id).await {
        Ok(mut notifications) => {
            // Covers transitions that landed before the subscription was live.
            if let Some(done) = refresh(feed, job_id, WatchMode::Push, states).await {
                return done;
            }
            loop {
                let grace_ends = (Instant::now() + config.push_grace).min(deadline);
                match timeout_at(grace_ends, notifications.next()).await {
                    Ok(Some(Ok(()))) => {
                        if let Some(done) = refresh(feed, job_id, WatchMode::Push, states).await {
                            return done;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        warn!(job_id, error = %err, "push stream failed, polling instead");
                        break;
                    }
                    Ok(None) => {
                        debug!(job_id, "push stream closed, polling instead");
                        break;
                    }
                    Err(_) if Instant::now() >= deadline => {
                        return ObserverState::StillProcessing {
                            job_id: Some(job_id.to_string()),
                        };
                    }
                    Err(_) => {
                        debug!(job_id, "no push within grace window, polling instead");
                        break;
                    }
                }
            }
        }
        Err(err) => debug!(job_id, error = %err, "push unavailable, polling"),
    }

    for attempt in 1..=config.poll_attempts {
        if let Some(done) = refresh(feed, job_id, WatchMode::Poll, states).await {
            return done;
        }
        if attempt < config.poll_attempts {
            sleep(config.poll_interval).await;
        }
    }
    ObserverState::StillProcessing {
        job_id: Some(job_id.to_string()),
    }
}

/// Re-fetches the canonical view. Returns the final state once the job is finished.
async fn refresh<F: JobFeed + ?Sized>(
    feed: &F,
    job_id: &str,
    via: WatchMode,
    states: &watch::Sender<ObserverState>,
) -> Option<ObserverState> {
    match feed.fetch(job_id).await {
        Ok(Some(job)) if job.is_finished() => Some(terminal(job)),
        Ok(Some(job)) => {
            states.send_replace(ObserverState::Watching { job, via });
            None
        }
        Ok(None) => {
            warn!(job_id, "job disappeared while watching");
            None
        }
        Err(err) => {
            warn!(job_id, error = %err, "job refresh failed");
            None
        }
    }
}

fn terminal(job: JobView) -> ObserverState {
    match job.status {
        JobStatus::Failed => ObserverState::Failed(job),
        _ => ObserverState::Completed(job),
    }
}
