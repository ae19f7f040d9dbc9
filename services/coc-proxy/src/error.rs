//! Service-specific error types

use thiserror::Error;

/// Startup lifecycle errors.
///
/// Per-request failures (upstream timeout, upstream transport error, rotator
/// not ready) are turned into HTTP responses by the proxy handler and never
/// propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key provisioning failed: {0}")]
    Provisioning(coc_keys::Error),

    #[error("rotator setup failed: {0}")]
    Rotator(coc_keys::Error),
}

impl Error {
    /// Whether startup may try again after this failure.
    ///
    /// Rejected credentials are a configuration problem and will fail the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provisioning(coc_keys::Error::InvalidCredentials(_)) => false,
            Error::Provisioning(_) => true,
            Error::Rotator(_) => false,
        }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
