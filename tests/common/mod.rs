use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use styllio::config::AppConfig;
use styllio::db::{self, PgPool};
use styllio::mailer::{Mailer, OutboundEmail};
use styllio::models::Job;
use styllio::payments::signature::{sign_payload, SIGNATURE_HEADER};
use styllio::payments::{
    CheckoutRequest, CheckoutSession, PaymentError, PaymentGateway, PaymentIntent,
};
use styllio::routes;
use styllio::state::{AppState, Services};
use styllio::storage::{ObjectStorage, StoredObject};
use styllio::trigger::{ProcessingTrigger, TriggerError};
use tokio::sync::{Barrier, Mutex};
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const CALLBACK_SECRET: &str = "callback-test-secret";
pub const PUBLIC_MEDIA_BASE: &str = "https://cdn.test";

/// Enough of a PNG header for format sniffing.
#[allow(dead_code)]
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type,
            },
        );
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn contains(&self, key: &str) -> bool {
        let guard = self.objects.lock().await;
        guard.contains_key(key)
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }
}

pub struct FakeGateway {
    intent_status: Mutex<String>,
    intent_lookups: AtomicUsize,
    intent_gate: Mutex<Option<Arc<Barrier>>>,
    checkouts: Mutex<Vec<CheckoutRequest>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            intent_status: Mutex::new("succeeded".to_string()),
            intent_lookups: AtomicUsize::new(0),
            intent_gate: Mutex::new(None),
            checkouts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let mut checkouts = self.checkouts.lock().await;
        checkouts.push(request.clone());
        let id = format!("cs_test_{}", checkouts.len());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.test/pay/{id}")),
            id,
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError> {
        self.intent_lookups.fetch_add(1, Ordering::SeqCst);
        let gate = self.intent_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        Ok(PaymentIntent {
            id: id.to_string(),
            status: self.intent_status.lock().await.clone(),
        })
    }
}

impl FakeGateway {
    #[allow(dead_code)]
    pub async fn set_intent_status(&self, status: &str) {
        *self.intent_status.lock().await = status.to_string();
    }

    /// Holds intent lookups until `deliveries` of them are in flight, so every
    /// delivery has already passed its session lookup before any of them inserts.
    #[allow(dead_code)]
    pub async fn gate_intent_lookups(&self, deliveries: usize) {
        *self.intent_gate.lock().await = Some(Arc::new(Barrier::new(deliveries)));
    }

    #[allow(dead_code)]
    pub fn intent_lookups(&self) -> usize {
        self.intent_lookups.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub async fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.checkouts.lock().await.clone()
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TriggerCall {
    pub job_id: String,
    pub image_urls: Vec<String>,
    pub style: String,
}

#[derive(Default)]
pub struct FakeTrigger {
    fail: AtomicBool,
    calls: Mutex<Vec<TriggerCall>>,
}

#[async_trait]
impl ProcessingTrigger for FakeTrigger {
    async fn trigger(
        &self,
        job_id: &str,
        image_urls: &[String],
        style: &str,
    ) -> Result<String, TriggerError> {
        self.calls.lock().await.push(TriggerCall {
            job_id: job_id.to_string(),
            image_urls: image_urls.to_vec(),
            style: style.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(TriggerError::Rejected {
                status: 503,
                message: "functions platform unavailable".to_string(),
            });
        }
        Ok(format!("exec_{job_id}"))
    }
}

impl FakeTrigger {
    #[allow(dead_code)]
    pub fn fail_next_calls(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub async fn calls(&self) -> Vec<TriggerCall> {
        self.calls.lock().await.clone()
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

impl RecordingMailer {
    #[allow(dead_code)]
    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousSession {
    pub user_id: Uuid,
    pub token: String,
    pub expires_in: i64,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    pub storage: Arc<FakeStorage>,
    pub gateway: Arc<FakeGateway>,
    pub trigger: Arc<FakeTrigger>,
    pub mailer: Arc<RecordingMailer>,
}

fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        database_url,
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        public_base_url: "http://localhost:3000".to_string(),
        cors_allowed_origin: None,
        session_secret: "test-session-secret".to_string(),
        session_issuer: "styllio-test".to_string(),
        session_audience: "styllio-test-web".to_string(),
        session_expiry_minutes: 60,
        claim_token_expiry_hours: 24,
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
        stripe_api_base: "http://127.0.0.1:9/v1".to_string(),
        stripe_webhook_tolerance_seconds: 300,
        checkout_currency: "eur".to_string(),
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".to_string(),
        s3_bucket: "test-bucket".to_string(),
        s3_public_base_url: Some(PUBLIC_MEDIA_BASE.to_string()),
        functions_endpoint: "http://127.0.0.1:9/v1".to_string(),
        functions_project_id: "test-project".to_string(),
        functions_api_key: "test-key".to_string(),
        style_function_id: Some("stylize".to_string()),
        processing_callback_secret: CALLBACK_SECRET.to_string(),
        email_api_url: "http://127.0.0.1:9/emails".to_string(),
        email_api_key: None,
        email_from: "Styllio <orders@styllio.test>".to_string(),
    }
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;
        let config = test_config(database_url);

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let gateway = Arc::new(FakeGateway::default());
        let trigger = Arc::new(FakeTrigger::default());
        let mailer = Arc::new(RecordingMailer::default());
        let services = Services {
            storage: storage.clone(),
            payments: gateway.clone(),
            trigger: trigger.clone(),
            mailer: mailer.clone(),
        };
        let state = AppState::new(pool, config, services);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            gateway,
            trigger,
            mailer,
        })
    }

    #[allow(dead_code)]
    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(|conn| truncate_all(conn)).await
    }

    #[allow(dead_code)]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body))?).await
    }

    #[allow(dead_code)]
    pub async fn post_empty(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        self.send(builder.body(Body::empty())?).await
    }

    #[allow(dead_code)]
    pub async fn anonymous_session(&self) -> Result<AnonymousSession> {
        let response = self.post_empty("/api/sessions/anonymous", None).await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "session bootstrap failed with status {}",
            response.status()
        );
        json_body(response).await
    }

    #[allow(dead_code)]
    pub async fn upload_image(
        &self,
        filename: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend(data);
        body.extend(b"\r\n");
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/uploads")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        self.send(request).await
    }

    /// Delivers a webhook body signed with the configured secret.
    #[allow(dead_code)]
    pub async fn deliver_webhook(&self, event: &Value) -> Result<hyper::Response<Body>> {
        let payload = serde_json::to_vec(event)?;
        let signature = sign_payload(&payload, WEBHOOK_SECRET, Utc::now().timestamp());
        self.deliver_webhook_with_signature(payload, &signature).await
    }

    #[allow(dead_code)]
    pub async fn deliver_webhook_with_signature(
        &self,
        payload: Vec<u8>,
        signature: &str,
    ) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhooks/stripe")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(payload))?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn post_status(&self, job_id: &str, update: &Value) -> Result<hyper::Response<Body>> {
        self.post_json(
            &format!("/api/internal/jobs/{job_id}/status"),
            update,
            Some(CALLBACK_SECRET),
        )
        .await
    }

    #[allow(dead_code)]
    pub async fn jobs_for_session(&self, session_id: &str) -> Result<Vec<Job>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            use styllio::schema::jobs;
            jobs::table
                .filter(jobs::payment_session_id.eq(&session_id))
                .load::<Job>(conn)
                .context("failed to load jobs")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn job(&self, job_id: &str) -> Result<Job> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            use styllio::schema::jobs;
            jobs::table
                .find(&job_id)
                .first::<Job>(conn)
                .context("failed to load job")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn job_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            use styllio::schema::jobs;
            jobs::table
                .count()
                .get_result(conn)
                .context("failed to count jobs")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

/// A `checkout.session.completed` event as the gateway delivers it.
#[allow(dead_code)]
pub fn checkout_completed_event(
    session_id: &str,
    file_ids: &[&str],
    claim_token_hash: Option<&str>,
) -> Value {
    let mut metadata = json!({
        "selectedStyle": "lunora",
        "fileIds": file_ids,
    });
    if let Some(hash) = claim_token_hash {
        metadata["claimTokenHash"] = json!(hash);
    }
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "object": "event",
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "object": "checkout.session",
                "payment_intent": format!("pi_{session_id}"),
                "payment_status": "paid",
                "amount_total": 300 * file_ids.len() as i64,
                "currency": "eur",
                "customer_details": {
                    "email": "jane.doe@example.com",
                    "name": "Jane Doe"
                },
                "metadata": metadata
            }
        }
    })
}

#[allow(dead_code)]
pub fn media_url(file_id: &str) -> String {
    format!("{PUBLIC_MEDIA_BASE}/uploads/{file_id}")
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn json_body<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("failed to decode response body")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute("TRUNCATE TABLE job_readers, job_claims, jobs, uploads CASCADE;")
        .context("failed to truncate tables")?;
    Ok(())
}
