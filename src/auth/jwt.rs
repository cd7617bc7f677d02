use anyhow::Result;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;

/// Signs and verifies the bearer tokens that identify anonymous browser sessions.
#[derive(Clone)]
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    expiry: Duration,
}

pub struct IssuedSession {
    pub user_id: Uuid,
    pub token: String,
    pub expires_in: i64,
}

impl SessionTokens {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.session_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.session_secret.as_bytes()),
            issuer: config.session_issuer.clone(),
            audience: config.session_audience.clone(),
            expiry: Duration::minutes(config.session_expiry_minutes),
        }
    }

    pub fn issue_anonymous(&self) -> Result<IssuedSession> {
        let user_id = Uuid::new_v4();
        let token = self.generate_token(user_id)?;
        Ok(IssuedSession {
            user_id,
            token,
            expires_in: self.expiry.num_seconds(),
        })
    }

    pub fn generate_token(&self, user_id: Uuid) -> Result<String> {
        let now = Utc::now();
        let exp = now + self.expiry;
        let claims = SessionClaims {
            sub: user_id,
            kind: ANONYMOUS_KIND.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp() as usize,
            exp: exp.timestamp() as usize,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify_token(&self, token: &str) -> Result<SessionClaims> {
        let mut validation = Validation::default();
        validation.set_audience(&[self.audience.clone()]);
        validation.set_issuer(&[self.issuer.clone()]);
        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        anyhow::ensure!(data.claims.kind == ANONYMOUS_KIND, "unexpected session kind");
        Ok(data.claims)
    }
}

const ANONYMOUS_KIND: &str = "anonymous";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub kind: String,
    pub iss: String,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
}
