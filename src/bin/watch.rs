use std::{env, sync::Arc};

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use styllio::client::{
    observer::{JobObserver, ObserverConfig, ObserverState},
    StyllioClient,
};

const USAGE: &str =
    "Usage: styllio-watch <base-url> (--session <checkout-session-id> | --job <job-id>) [--claim-token <token>] [--poll-only]";

enum Target {
    Session(String),
    Job(String),
}

struct Args {
    base_url: String,
    target: Target,
    claim_token: Option<String>,
    poll_only: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = env::args().skip(1);
    let base_url = args.next().context(USAGE)?;
    let mut target = None;
    let mut claim_token = None;
    let mut poll_only = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--session" => target = Some(Target::Session(args.next().context(USAGE)?)),
            "--job" => target = Some(Target::Job(args.next().context(USAGE)?)),
            "--claim-token" => claim_token = Some(args.next().context(USAGE)?),
            "--poll-only" => poll_only = true,
            other => bail!("unknown argument {other}\n{USAGE}"),
        }
    }

    Ok(Args {
        base_url,
        target: target.context(USAGE)?,
        claim_token,
        poll_only,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let mut client = StyllioClient::new(args.base_url);
    if !args.poll_only {
        match client.create_anonymous_session().await {
            Ok(session) => client = client.with_session(session),
            Err(err) => tracing::warn!(error = %err, "anonymous session unavailable, polling only"),
        }
    }
    if let Some(token) = args.claim_token {
        client = client.with_claim_token(token);
    }

    let observer = JobObserver::new(Arc::new(client), ObserverConfig::default());
    let handle = match args.target {
        Target::Session(session_id) => observer.spawn_for_session(session_id),
        Target::Job(job_id) => observer.spawn_for_job(job_id),
    };

    let mut states = handle.states();
    let render = async {
        loop {
            let state = states.borrow_and_update().clone();
            report(&state);
            if state.is_final() || states.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = render => {}
        _ = signal::ctrl_c() => {
            tracing::info!("stopping job observer");
            handle.stop();
        }
    }

    match handle.finished().await {
        ObserverState::Completed(job) => {
            for url in &job.processed_images {
                println!("{url}");
            }
        }
        ObserverState::Failed(job) => {
            eprintln!(
                "job {} failed: {}",
                job.id,
                job.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(2);
        }
        ObserverState::StillProcessing { .. } => {
            println!("Processing continues. You will be notified by email when it is ready.");
        }
        _ => {}
    }

    Ok(())
}

fn report(state: &ObserverState) {
    match state {
        ObserverState::Resolving { attempt } => {
            tracing::info!(attempt, "looking up job for payment session")
        }
        ObserverState::Watching { job, via } => tracing::info!(
            job_id = %job.id,
            status = job.status.as_str(),
            progress = job.progress.unwrap_or_default(),
            via = ?via,
            "job in progress"
        ),
        ObserverState::Completed(job) => {
            tracing::info!(job_id = %job.id, outputs = job.processed_images.len(), "job completed")
        }
        ObserverState::Failed(job) => tracing::warn!(job_id = %job.id, "job failed"),
        ObserverState::StillProcessing { job_id } => {
            tracing::info!(job_id = job_id.as_deref().unwrap_or("-"), "still processing")
        }
        ObserverState::Stopped => tracing::info!("stopped"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
