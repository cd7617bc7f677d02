//! HTTP client for the job API and the status observation protocol built on it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use styllio::client::{observer::{JobObserver, ObserverConfig}, StyllioClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = StyllioClient::new("http://localhost:3000");
//! let handle = JobObserver::new(Arc::new(client), ObserverConfig::default())
//!     .spawn_for_session("cs_test_123".to_string());
//! let outcome = handle.finished().await;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod observer;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{ClientError, Result};

use crate::projection::JobView;

/// One item per change notification. Carries no state; the receiver re-fetches.
pub type Notifications = BoxStream<'static, Result<()>>;

/// What the observer needs from the server.
#[async_trait]
pub trait JobFeed: Send + Sync + 'static {
    async fn find_by_session(&self, session_id: &str) -> Result<Option<JobView>>;

    async fn fetch(&self, job_id: &str) -> Result<Option<JobView>>;

    async fn subscribe(&self, job_id: &str) -> Result<Notifications>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousSession {
    pub user_id: Uuid,
    pub token: String,
    pub expires_in: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody<'a> {
    claim_token: &'a str,
    user_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct StyllioClient {
    base_url: String,
    client: Client,
    session: Option<AnonymousSession>,
    claim_token: Option<String>,
}

impl StyllioClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            session: None,
            claim_token: None,
        }
    }

    pub fn with_session(mut self, session: AnonymousSession) -> Self {
        self.session = Some(session);
        self
    }

    /// The one-time token from checkout; redeemed before subscribing to push.
    pub fn with_claim_token(mut self, claim_token: impl Into<String>) -> Self {
        self.claim_token = Some(claim_token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let session = self.session.as_ref().ok_or(ClientError::NoSession)?;
        Ok(builder.bearer_auth(&session.token))
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), message));
        }
        response
            .json()
            .await
            .map_err(|err| ClientError::ParseError(format!("failed to parse JSON response: {err}")))
    }

    async fn optional_job(response: reqwest::Response) -> Result<Option<JobView>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_response(response).await.map(Some)
    }

    pub async fn create_anonymous_session(&self) -> Result<AnonymousSession> {
        let url = format!("{}/api/sessions/anonymous", self.base_url);
        let response = self.client.post(&url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn find_job_by_session(&self, session_id: &str) -> Result<Option<JobView>> {
        let url = format!("{}/api/jobs", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("sessionId", session_id)])
            .send()
            .await?;
        Self::optional_job(response).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobView>> {
        let url = format!("{}/api/jobs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;
        Self::optional_job(response).await
    }

    pub async fn claim_job(&self, job_id: &str, claim_token: &str) -> Result<()> {
        let session = self.session.as_ref().ok_or(ClientError::NoSession)?;
        let url = format!("{}/api/jobs/{}/claim", self.base_url, job_id);
        let response = self
            .authorized(self.client.post(&url))?
            .json(&ClaimBody {
                claim_token,
                user_id: session.user_id,
            })
            .send()
            .await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        Ok(())
    }

    pub async fn job_events(&self, job_id: &str) -> Result<Notifications> {
        let url = format!("{}/api/jobs/{}/events", self.base_url, job_id);
        let response = self
            .authorized(self.client.get(&url))?
            .header("accept", "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::api_error(status.as_u16(), message));
        }

        // Keep-alive comments carry no data and are not notifications.
        let notifications = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) if event.data.is_empty() => None,
                    Ok(_) => Some(Ok(())),
                    Err(err) => Some(Err(ClientError::from(err))),
                }
            });

        Ok(notifications.boxed())
    }
}

#[async_trait]
impl JobFeed for StyllioClient {
    async fn find_by_session(&self, session_id: &str) -> Result<Option<JobView>> {
        self.find_job_by_session(session_id).await
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<JobView>> {
        self.get_job(job_id).await
    }

    /// Redeems the claim token first when one was supplied; a token already used
    /// by an earlier run is not fatal since the grant persists.
    async fn subscribe(&self, job_id: &str) -> Result<Notifications> {
        if self.session.is_none() {
            return Err(ClientError::NoSession);
        }
        if let Some(token) = &self.claim_token {
            if let Err(err) = self.claim_job(job_id, token).await {
                tracing::debug!(job_id, error = %err, "claim not redeemed");
            }
        }
        self.job_events(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job_json(status: &str) -> serde_json::Value {
        json!({
            "id": "jane-abc12345",
            "status": status,
            "progress": 0,
            "resultUrl": null,
            "originalImageUrls": ["https://cdn.test/uploads/f1"],
            "processedImages": [],
            "error": null,
            "createdAt": "2025-06-01T10:00:00Z",
            "updatedAt": "2025-06-01T10:00:00Z",
            "completedAt": null,
            "metadata": {
                "style": "lunora",
                "imageCount": 1,
                "customerEmail": "jane@example.com",
                "paymentStatus": "paid"
            }
        })
    }

    #[tokio::test]
    async fn session_lookup_maps_404_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs"))
            .and(query_param("sessionId", "cs_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "resource not found" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/jobs"))
            .and(query_param("sessionId", "cs_found"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_json("queuing")))
            .mount(&server)
            .await;

        let client = StyllioClient::new(server.uri());
        assert!(client.find_job_by_session("cs_missing").await.unwrap().is_none());
        let job = client.find_job_by_session("cs_found").await.unwrap().unwrap();
        assert_eq!(job.id, "jane-abc12345");
    }

    #[tokio::test]
    async fn server_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/jane-abc12345"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = StyllioClient::new(server.uri())
            .get_job("jane-abc12345")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ApiError { status: 503, .. }));
    }

    #[tokio::test]
    async fn subscribing_without_session_fails_fast() {
        let client = StyllioClient::new("http://127.0.0.1:9");
        let err = client.subscribe("jane-abc12345").await.err().unwrap();
        assert!(matches!(err, ClientError::NoSession));
    }

    #[tokio::test]
    async fn event_stream_yields_one_item_per_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/jane-abc12345/events"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        ": keep-alive\n\nevent: job\ndata: {\"status\":\"processing\"}\n\nevent: job\ndata: {\"status\":\ndata: \"completed\"}\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let client = StyllioClient::new(server.uri()).with_session(AnonymousSession {
            user_id: Uuid::new_v4(),
            token: "session-token".to_string(),
            expires_in: 60,
        });
        let notifications: Vec<_> = client
            .job_events("jane-abc12345")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|item| item.is_ok()));
    }
}
