pub mod signature;
pub mod stripe;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use self::stripe::StripeGateway;

pub const PAYMENT_INTENT_SUCCEEDED: &str = "succeeded";

pub const CHECKOUT_COMPLETED_EVENTS: &[&str] = &[
    "checkout.session.completed",
    "checkout.session.async_payment_succeeded",
];

/// Metadata keys written at checkout and read back from the completion event.
pub mod metadata_keys {
    pub const SELECTED_STYLE: &str = "selectedStyle";
    pub const FILE_IDS: &str = "fileIds";
    pub const CLAIM_TOKEN_HASH: &str = "claimTokenHash";
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("payment gateway returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("unexpected payment gateway response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub product_name: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
}

impl PaymentIntent {
    pub fn is_succeeded(&self) -> bool {
        self.status == PAYMENT_INTENT_SUCCEEDED
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckoutEventError {
    #[error("checkout session object is malformed")]
    MalformedSession,
    #[error("checkout session is missing {0}")]
    MissingField(&'static str),
    #[error("checkout metadata field {0} is malformed")]
    MalformedMetadata(&'static str),
}

/// A completed checkout, normalised from the gateway's event object.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCheckout {
    pub session_id: String,
    pub payment_intent_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub payment_status: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub selected_style: String,
    pub file_ids: Vec<String>,
    pub claim_token_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    #[serde(default)]
    payment_intent: Option<Value>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<RawCustomerDetails>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawCustomerDetails {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl CompletedCheckout {
    pub fn from_event_object(object: &Value) -> Result<Self, CheckoutEventError> {
        let raw: RawCheckoutSession = serde_json::from_value(object.clone())
            .map_err(|_| CheckoutEventError::MalformedSession)?;

        // The intent may be expanded into an object or left as an id.
        let payment_intent_id = match raw.payment_intent {
            Some(Value::String(id)) => id,
            Some(Value::Object(intent)) => intent
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(CheckoutEventError::MissingField("payment_intent"))?,
            _ => return Err(CheckoutEventError::MissingField("payment_intent")),
        };

        let (details_email, customer_name) = match raw.customer_details {
            Some(details) => (details.email, details.name),
            None => (None, None),
        };
        let customer_email = details_email
            .or(raw.customer_email)
            .filter(|email| !email.trim().is_empty())
            .ok_or(CheckoutEventError::MissingField("customer email"))?;

        let selected_style = raw
            .metadata
            .get(metadata_keys::SELECTED_STYLE)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(CheckoutEventError::MissingField(metadata_keys::SELECTED_STYLE))?;

        let file_ids = normalize_file_ids(raw.metadata.get(metadata_keys::FILE_IDS))?;

        let claim_token_hash = raw
            .metadata
            .get(metadata_keys::CLAIM_TOKEN_HASH)
            .and_then(Value::as_str)
            .filter(|hash| crate::auth::tokens::is_token_hash(hash))
            .map(str::to_string);

        Ok(Self {
            session_id: raw.id,
            payment_intent_id,
            customer_email,
            customer_name: customer_name.filter(|name| !name.trim().is_empty()),
            payment_status: raw.payment_status.unwrap_or_else(|| "unknown".to_string()),
            amount_total: raw.amount_total,
            currency: raw.currency,
            selected_style,
            file_ids,
            claim_token_hash,
        })
    }
}

/// File ids arrive either as a JSON-encoded string or as a native array.
pub fn normalize_file_ids(value: Option<&Value>) -> Result<Vec<String>, CheckoutEventError> {
    let decoded;
    let array = match value {
        Some(Value::Array(items)) => items,
        Some(Value::String(encoded)) => {
            decoded = serde_json::from_str::<Value>(encoded)
                .map_err(|_| CheckoutEventError::MalformedMetadata(metadata_keys::FILE_IDS))?;
            match &decoded {
                Value::Array(items) => items,
                _ => return Err(CheckoutEventError::MalformedMetadata(metadata_keys::FILE_IDS)),
            }
        }
        Some(_) => return Err(CheckoutEventError::MalformedMetadata(metadata_keys::FILE_IDS)),
        None => return Err(CheckoutEventError::MissingField(metadata_keys::FILE_IDS)),
    };

    let mut ids = Vec::with_capacity(array.len());
    for item in array {
        let id = item
            .as_str()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(CheckoutEventError::MalformedMetadata(metadata_keys::FILE_IDS))?;
        if !ids.iter().any(|existing: &String| existing == id) {
            ids.push(id.to_string());
        }
    }

    if ids.is_empty() {
        return Err(CheckoutEventError::MissingField(metadata_keys::FILE_IDS));
    }
    Ok(ids)
}
