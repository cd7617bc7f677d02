use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::AppConfig;

const FAILED_EXECUTION: &str = "failed";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("style function id is not configured")]
    NotConfigured,
    #[error("functions platform rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("functions platform request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid functions platform response: {0}")]
    InvalidResponse(String),
}

/// Starts out-of-process stylization for a job and returns the execution reference.
#[async_trait]
pub trait ProcessingTrigger: Send + Sync + 'static {
    async fn trigger(
        &self,
        job_id: &str,
        image_urls: &[String],
        style: &str,
    ) -> Result<String, TriggerError>;
}

/// Client for the serverless functions platform hosting the stylization function.
pub struct FunctionTrigger {
    client: Client,
    endpoint: String,
    project_id: String,
    api_key: String,
    function_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionPayload<'a> {
    job_id: &'a str,
    image_urls: &'a [String],
    style_name: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct CreateExecution {
    body: String,
    #[serde(rename = "async")]
    run_async: bool,
    method: &'static str,
}

#[derive(Debug, Deserialize)]
struct ExecutionList {
    #[serde(default)]
    executions: Vec<Execution>,
}

#[derive(Debug, Deserialize)]
struct Execution {
    #[serde(rename = "$id")]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "responseBody")]
    response_body: String,
    #[serde(default)]
    logs: String,
}

impl Execution {
    fn serves_job(&self, job_id: &str) -> bool {
        self.status != FAILED_EXECUTION
            && (self.response_body.contains(job_id) || self.logs.contains(job_id))
    }
}

impl FunctionTrigger {
    pub fn new(
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
        function_id: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            api_key: api_key.into(),
            function_id,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.functions_endpoint.clone(),
            config.functions_project_id.clone(),
            config.functions_api_key.clone(),
            config.style_function_id.clone(),
        )
    }

    fn executions_url(&self, function_id: &str) -> String {
        format!("{}/functions/{}/executions", self.endpoint, function_id)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Appwrite-Project", &self.project_id)
            .header("X-Appwrite-Key", &self.api_key)
    }

    /// A live execution already working on this job, if the platform knows of one.
    async fn find_existing(
        &self,
        function_id: &str,
        job_id: &str,
    ) -> Result<Option<String>, TriggerError> {
        let response = self
            .authorized(self.client.get(self.executions_url(function_id)))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let list: ExecutionList = response
            .json()
            .await
            .map_err(|err| TriggerError::InvalidResponse(err.to_string()))?;
        Ok(list
            .executions
            .into_iter()
            .find(|execution| execution.serves_job(job_id))
            .map(|execution| execution.id))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TriggerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(TriggerError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ProcessingTrigger for FunctionTrigger {
    async fn trigger(
        &self,
        job_id: &str,
        image_urls: &[String],
        style: &str,
    ) -> Result<String, TriggerError> {
        let function_id = self
            .function_id
            .as_deref()
            .ok_or(TriggerError::NotConfigured)?;

        match self.find_existing(function_id, job_id).await {
            Ok(Some(execution_ref)) => {
                tracing::info!(job_id, execution_ref = %execution_ref, "reusing existing execution");
                return Ok(execution_ref);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(job_id, error = %err, "could not list executions, submitting a new one");
            }
        }

        let payload = ExecutionPayload {
            job_id,
            image_urls,
            style_name: style,
            timestamp: Utc::now().to_rfc3339(),
        };
        let request = CreateExecution {
            body: serde_json::to_string(&payload)
                .map_err(|err| TriggerError::InvalidResponse(err.to_string()))?,
            run_async: true,
            method: "POST",
        };

        let response = self
            .authorized(self.client.post(self.executions_url(function_id)))
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let created: Value = response
            .json()
            .await
            .map_err(|err| TriggerError::InvalidResponse(err.to_string()))?;
        let execution_ref = created
            .get("$id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TriggerError::InvalidResponse("missing execution id".to_string()))?
            .to_string();

        tracing::info!(
            job_id,
            execution_ref = %execution_ref,
            images = image_urls.len(),
            "submitted stylization execution"
        );
        Ok(execution_ref)
    }
}
