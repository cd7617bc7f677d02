use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::AppConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, email: &OutboundEmail) -> Result<()>;
}

/// Order confirmation with a link to the job status page.
pub fn confirmation_email(to: &str, customer_name: Option<&str>, job_link: &str) -> OutboundEmail {
    let greeting = match customer_name {
        Some(name) => format!("Hi {name},"),
        None => "Hi,".to_string(),
    };
    OutboundEmail {
        to: to.to_string(),
        subject: "Your Styllio order is being processed".to_string(),
        html: format!(
            "<p>{greeting}</p>\
             <p>Thanks for your order. Your images are being stylized now.</p>\
             <p><a href=\"{job_link}\">Track your order</a></p>"
        ),
        text: format!(
            "{greeting}\n\nThanks for your order. Your images are being stylized now.\n\nTrack your order: {job_link}\n"
        ),
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

/// Transactional email over an HTTP API.
pub struct HttpMailer {
    client: Client,
    url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&SendRequest {
                from: &self.from,
                to: [email.to.as_str()],
                subject: &email.subject,
                html: &email.html,
                text: &email.text,
            })
            .send()
            .await
            .context("failed to reach email API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("email API returned {status}: {body}");
        }
        Ok(())
    }
}

/// Used when no email API key is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        tracing::info!(to = %email.to, subject = %email.subject, "email delivery disabled, skipping");
        Ok(())
    }
}

pub fn build_mailer(config: &AppConfig) -> Arc<dyn Mailer> {
    match &config.email_api_key {
        Some(key) => Arc::new(HttpMailer::new(
            config.email_api_url.clone(),
            key.clone(),
            config.email_from.clone(),
        )),
        None => Arc::new(LogMailer),
    }
}
