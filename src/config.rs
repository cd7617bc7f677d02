use std::env;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
pub const DEFAULT_EMAIL_API_URL: &str = "https://api.resend.com/emails";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub public_base_url: String,
    pub cors_allowed_origin: Option<String>,
    pub session_secret: String,
    pub session_issuer: String,
    pub session_audience: String,
    pub session_expiry_minutes: i64,
    pub claim_token_expiry_hours: i64,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub stripe_webhook_tolerance_seconds: i64,
    pub checkout_currency: String,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
    pub s3_public_base_url: Option<String>,
    pub functions_endpoint: String,
    pub functions_project_id: String,
    pub functions_api_key: String,
    pub style_function_id: Option<String>,
    pub processing_callback_secret: String,
    pub email_api_url: String,
    pub email_api_key: Option<String>,
    pub email_from: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{server_port}"));
        let public_base_url = normalize_base_url(&public_base_url)
            .context("PUBLIC_BASE_URL must be an absolute http(s) URL")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let session_secret = env::var("SESSION_SECRET").context("SESSION_SECRET must be set")?;
        let session_issuer = env::var("SESSION_ISSUER").unwrap_or_else(|_| "styllio".to_string());
        let session_audience =
            env::var("SESSION_AUDIENCE").unwrap_or_else(|_| "styllio-clients".to_string());
        let session_expiry_minutes = env::var("SESSION_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "1440".to_string())
            .parse()
            .context("SESSION_EXPIRY_MINUTES must be an integer")?;
        let claim_token_expiry_hours = env::var("CLAIM_TOKEN_EXPIRY_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .context("CLAIM_TOKEN_EXPIRY_HOURS must be an integer")?;
        let stripe_secret_key =
            env::var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY must be set")?;
        let stripe_webhook_secret =
            env::var("STRIPE_WEBHOOK_SECRET").context("STRIPE_WEBHOOK_SECRET must be set")?;
        let stripe_api_base =
            env::var("STRIPE_API_BASE").unwrap_or_else(|_| DEFAULT_STRIPE_API_BASE.to_string());
        let stripe_webhook_tolerance_seconds = env::var("STRIPE_WEBHOOK_TOLERANCE_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("STRIPE_WEBHOOK_TOLERANCE_SECONDS must be an integer")?;
        let checkout_currency = env::var("CHECKOUT_CURRENCY")
            .map(|value| value.to_lowercase())
            .unwrap_or_else(|_| "usd".to_string());
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok();
        let aws_access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
        let aws_secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET").context("S3_BUCKET must be set")?;
        let s3_public_base_url = env::var("S3_PUBLIC_BASE_URL")
            .ok()
            .map(|value| value.trim_end_matches('/').to_string());
        let functions_endpoint =
            env::var("FUNCTIONS_ENDPOINT").context("FUNCTIONS_ENDPOINT must be set")?;
        let functions_project_id =
            env::var("FUNCTIONS_PROJECT_ID").context("FUNCTIONS_PROJECT_ID must be set")?;
        let functions_api_key =
            env::var("FUNCTIONS_API_KEY").context("FUNCTIONS_API_KEY must be set")?;
        let style_function_id = env::var("STYLE_FUNCTION_ID")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let processing_callback_secret = env::var("PROCESSING_CALLBACK_SECRET")
            .context("PROCESSING_CALLBACK_SECRET must be set")?;
        let email_api_url =
            env::var("EMAIL_API_URL").unwrap_or_else(|_| DEFAULT_EMAIL_API_URL.to_string());
        let email_api_key = env::var("EMAIL_API_KEY").ok();
        let email_from =
            env::var("EMAIL_FROM").unwrap_or_else(|_| "Styllio <hello@styllio.app>".to_string());

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            public_base_url,
            cors_allowed_origin,
            session_secret,
            session_issuer,
            session_audience,
            session_expiry_minutes,
            claim_token_expiry_hours,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_api_base,
            stripe_webhook_tolerance_seconds,
            checkout_currency,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            s3_public_base_url,
            functions_endpoint,
            functions_project_id,
            functions_api_key,
            style_function_id,
            processing_callback_secret,
            email_api_url,
            email_api_key,
            email_from,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn job_page_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{}", self.public_base_url, job_id)
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim())?;
    anyhow::ensure!(
        matches!(parsed.scheme(), "http" | "https"),
        "unsupported scheme {}",
        parsed.scheme()
    );
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
