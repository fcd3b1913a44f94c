use thiserror::Error;

/// Failure taxonomy of the replication clients. Handlers pattern-match on
/// these instead of inspecting status codes.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credential rejected. The caller refreshes the session and retries the
    /// failing call exactly once before deferring with backoff.
    #[error("unauthorized")]
    Unauthorized,

    /// Connect failure or timeout. Retryable with backoff.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The server answered 2xx but returned no record where one was
    /// expected. Not retryable; the work item is failed.
    #[error("empty response from {url}")]
    EmptyResponse { url: String },

    #[error("not found")]
    NotFound,

    /// Duplicate create. The caller adopts the existing resource.
    #[error("conflict")]
    Conflict,

    /// Malformed payload; the item fails permanently.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal client error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            ClientError::Unreachable(e.to_string())
        } else {
            ClientError::Internal(e.to_string())
        }
    }
}
