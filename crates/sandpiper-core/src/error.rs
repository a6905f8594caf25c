use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Behavioural error kinds shared across the daemon.
///
/// `NotFound` is load-bearing: the authentication layer turns it into a
/// distinct defender event, so store implementations must return it for
/// unknown users rather than a generic failure.
#[derive(Error, Debug)]
pub enum Error {
    /// Input data failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// A requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The feature is disabled in the configuration
    #[error("method disabled: {0}")]
    MethodDisabled(String),

    /// Credentials did not match
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Uncategorized error
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
