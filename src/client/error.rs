use eventsource_stream::EventStreamError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// Push needs an anonymous session; callers fall back to polling.
    #[error("no anonymous session available")]
    NoSession,

    #[error("push stream closed")]
    StreamClosed,
}

impl ClientError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }
}

impl From<EventStreamError<reqwest::Error>> for ClientError {
    fn from(value: EventStreamError<reqwest::Error>) -> Self {
        match value {
            EventStreamError::Transport(err) => Self::RequestFailed(err),
            other => Self::ParseError(other.to_string()),
        }
    }
}
