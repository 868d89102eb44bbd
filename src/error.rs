use thiserror::Error;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KilnError {
    /// True when a job handler should hand this back to the queue for a
    /// delayed retry rather than marking the entity failed.
    ///
    /// Classification: transient I/O, timeouts, rate limits, and 5xx
    /// upstream responses retry; auth failures, other 4xx, decode failures,
    /// and local invariant violations are fatal.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => match status {
                Some(code) => *code >= 500,
                None => true,
            },
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Storage(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a sanitized message safe for entity error columns and
    /// streamed `*:failed` events. Does not leak internal URLs, connection
    /// details, or upstream response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid input: {msg}"),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Forbidden(_) => "not allowed".to_string(),
            Self::InvalidState(msg) => format!("invalid state: {msg}"),
            Self::Timeout(ms) => format!("timed out after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}: try again shortly")
            }
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::Upstream { provider, .. } => format!("upstream error from {provider}"),
            Self::Parse(_) => "failed to parse provider response".to_string(),
            Self::Storage(_) => "storage operation failed".to_string(),
            Self::Db(_) | Self::Integrity(_) => "internal storage error".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Io(_) => "an I/O error occurred".to_string(),
        }
    }
}

impl From<rusqlite::Error> for KilnError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                KilnError::Integrity(msg.unwrap_or_else(|| err.to_string()))
            }
            other => KilnError::Db(other.to_string()),
        }
    }
}
