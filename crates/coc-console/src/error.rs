//! Error types for developer console operations

/// Errors from developer console operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),

    #[error("console returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed console response: {0}")]
    MalformedResponse(String),

    #[error("account key limit reached: {0}")]
    TooManyKeys(String),

    #[error("address unavailable: {0}")]
    AddressUnavailable(String),
}

impl Error {
    /// Whether a key creation that failed this way is worth retrying.
    ///
    /// Transport failures (timeouts included), non-2xx statuses and malformed
    /// bodies are transient. Credential and key-limit errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Status { .. } | Error::MalformedResponse(_)
        )
    }
}

/// Result alias for console operations.
pub type Result<T> = std::result::Result<T, Error>;
