//! Object Store Error Types
//!
//! Structured error handling for object store operations.
//! Maps HTTP status codes to specific error variants for retry and not-found decisions.

/// Object store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Authorization token expired")]
    AuthExpired,

    #[error("Too many requests")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl StoreError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RateLimited
                | StoreError::Timeout
                | StoreError::Network(_)
                | StoreError::Server(_, _)
                | StoreError::AuthExpired
        )
    }

    /// Create a StoreError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => StoreError::AuthExpired,
            403 => StoreError::Forbidden(body.to_string()),
            404 => StoreError::NotFound(body.to_string()),
            408 => StoreError::Timeout,
            429 => StoreError::RateLimited,
            500..=599 => StoreError::Server(status, body.to_string()),
            _ => StoreError::Request(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Classify a transport-level reqwest failure
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            StoreError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            StoreError::from_status(status.as_u16(), &err.to_string())
        } else {
            StoreError::Request(err.to_string())
        }
    }
}

/// Whether an error chain carries a [`StoreError::NotFound`]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        )
    })
}

/// The first [`StoreError`] in an error chain, if any
pub fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}
