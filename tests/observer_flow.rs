mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, checkout_completed_event, json_body, TestApp};
use serde::Deserialize;
use serde_json::json;
use styllio::auth::tokens::hash_claim_token;
use styllio::client::observer::{JobObserver, ObserverConfig, ObserverState, WatchMode};
use styllio::client::StyllioClient;
use tokio::net::TcpListener;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    job_id: Option<String>,
}

async fn serve(app: &TestApp) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = app.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(format!("http://{addr}"))
}

fn quick_config() -> ObserverConfig {
    ObserverConfig {
        resolve_attempts: 20,
        resolve_interval: Duration::from_millis(50),
        push_grace: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        poll_attempts: 200,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_observer_follows_job_to_completion() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let base_url = serve(&app).await?;

    // No anonymous session: the observer goes straight to polling.
    let client = StyllioClient::new(base_url);
    let handle = JobObserver::new(Arc::new(client), quick_config())
        .spawn_for_session("sess_observe".to_string());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let event = checkout_completed_event("sess_observe", &["f1"], None);
    let ack: WebhookAck = json_body(app.deliver_webhook(&event).await?).await?;
    let job_id = ack.job_id.context("job not created")?;

    let mut states = handle.states();
    states
        .wait_for(|state| matches!(state, ObserverState::Watching { via: WatchMode::Poll, .. }))
        .await?;

    let processing = app
        .post_status(&job_id, &json!({ "status": "processing", "progress": 50 }))
        .await?;
    assert_eq!(processing.status(), StatusCode::OK);
    let completed = app
        .post_status(
            &job_id,
            &json!({ "status": "completed", "outputImageUrls": ["https://cdn.test/out/1.png"] }),
        )
        .await?;
    assert_eq!(completed.status(), StatusCode::OK);

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.finished()).await?;
    match outcome {
        ObserverState::Completed(job) => {
            assert_eq!(job.id, job_id);
            assert_eq!(job.processed_images, vec!["https://cdn.test/out/1.png"]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    app.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_observer_refetches_on_notification() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let base_url = serve(&app).await?;

    let claim_token = "push-observer-claim-token";
    let claim_hash = hash_claim_token(claim_token);
    let event = checkout_completed_event("sess_push", &["f1"], Some(&claim_hash));
    let ack: WebhookAck = json_body(app.deliver_webhook(&event).await?).await?;
    let job_id = ack.job_id.context("job not created")?;

    let client = StyllioClient::new(base_url);
    let session = client.create_anonymous_session().await?;
    let client = client
        .with_session(session)
        .with_claim_token(claim_token);

    let handle = JobObserver::new(Arc::new(client), quick_config())
        .spawn_for_session("sess_push".to_string());
    let mut states = handle.states();
    states
        .wait_for(|state| matches!(state, ObserverState::Watching { via: WatchMode::Push, .. }))
        .await?;

    let failed = app
        .post_status(
            &job_id,
            &json!({ "status": "failed", "errorMessage": "content policy" }),
        )
        .await?;
    assert_eq!(failed.status(), StatusCode::OK);

    let outcome = tokio::time::timeout(Duration::from_secs(4), handle.finished()).await?;
    match outcome {
        ObserverState::Failed(job) => assert_eq!(job.error.as_deref(), Some("content policy")),
        other => panic!("unexpected outcome: {other:?}"),
    }

    app.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolved_session_gives_up_softly() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let base_url = serve(&app).await?;

    let config = ObserverConfig {
        resolve_attempts: 4,
        resolve_interval: Duration::from_millis(20),
        ..quick_config()
    };
    let handle = JobObserver::new(Arc::new(StyllioClient::new(base_url)), config)
        .spawn_for_session("sess_never_paid".to_string());

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.finished()).await?;
    assert_eq!(outcome, ObserverState::StillProcessing { job_id: None });

    app.cleanup().await?;
    Ok(())
}
