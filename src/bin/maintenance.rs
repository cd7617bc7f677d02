use std::env;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use styllio::{config::AppConfig, db, jobs, schema::job_claims};

const USAGE: &str = "Usage: maintenance <purge-claims | list-stalled [minutes]>";
const DEFAULT_STALLED_MINUTES: i64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-claims") => purge_claims()?,
        Some("list-stalled") => {
            let minutes = match args.next() {
                Some(raw) => raw.parse().context("minutes must be a whole number")?,
                None => DEFAULT_STALLED_MINUTES,
            };
            list_stalled(minutes)?
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect() -> Result<db::PgPool> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded configuration"
    );
    db::init_pool_with_size(&config.database_url, 1)
}

/// Claim rows are dead weight once redeemed or expired; the read grants they produced stay.
fn purge_claims() -> Result<()> {
    let pool = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let removed = diesel::delete(
        job_claims::table.filter(
            job_claims::used_at
                .is_not_null()
                .or(job_claims::expires_at.lt(Utc::now().naive_utc())),
        ),
    )
    .execute(&mut conn)
    .context("failed to purge claim tokens")?;

    println!("Removed {removed} used or expired claim tokens.");
    Ok(())
}

/// Reports jobs that never reached a terminal status. Nothing is changed: the
/// processing function may still write back.
fn list_stalled(minutes: i64) -> Result<()> {
    let pool = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let cutoff = Utc::now().naive_utc() - Duration::minutes(minutes);
    let stalled = jobs::list_stalled(&mut conn, cutoff).context("failed to load stalled jobs")?;

    if stalled.is_empty() {
        println!("No jobs idle for more than {minutes} minutes.");
        return Ok(());
    }

    for job in &stalled {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            job.id,
            job.status,
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
            job.processing_execution_ref.as_deref().unwrap_or("-"),
            job.customer_email
        );
    }
    println!("{} stalled jobs.", stalled.len());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
