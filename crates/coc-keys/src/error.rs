//! Error types for provisioning and rotation

/// Errors from provisioning and rotation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("target address unavailable: {0}")]
    AddressUnavailable(String),

    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),

    #[error("no usable keys for {email}: account holds {held} keys and none could be created")]
    ProvisioningExhausted { email: String, held: usize },

    #[error("no keys available after provisioning")]
    NoTokensAvailable,

    #[error("rotator not ready")]
    RotatorNotReady,

    #[error("rotator pool is empty")]
    EmptyPool,

    #[error("rotator has been torn down")]
    RotatorClosed,

    #[error("rotator already initialized with a different pool")]
    PoolMismatch,

    #[error("console error: {0}")]
    Console(String),

    #[error("shared state error: {0}")]
    Persist(String),
}

impl Error {
    /// Whether startup should retry the whole provisioning run after this.
    ///
    /// Only address resolution and console transport failures qualify; bad
    /// credentials and an exhausted account will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AddressUnavailable(_) | Error::Console(_))
    }
}

impl From<coc_console::Error> for Error {
    fn from(err: coc_console::Error) -> Self {
        match err {
            coc_console::Error::InvalidCredentials(email) => Error::InvalidCredentials(email),
            coc_console::Error::AddressUnavailable(msg) => Error::AddressUnavailable(msg),
            other => Error::Console(other.to_string()),
        }
    }
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
