//! Error types for the SSH front-end.

use sandpiper_core::LoginMethod;
use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: unsupported algorithm, bad path, bad
    /// binding. Fatal at initialize, never partially applied.
    #[error("configuration error: {0}")]
    Config(String),

    /// An authentication attempt failed. Carries the login method the
    /// attempt was made with so failure bookkeeping can tag metrics and
    /// defender events.
    #[error("authentication error ({method}): {source}")]
    Authentication {
        method: LoginMethod,
        #[source]
        source: Box<Error>,
    },

    /// A new connection was refused before the handshake
    #[error("connection refused: {0}")]
    Admission(String),

    /// SSH command processing error
    #[error("command error: {0}")]
    Command(String),

    /// Error from a core collaborator (store, VFS, defender)
    #[error(transparent)]
    Core(#[from] sandpiper_core::Error),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Uncategorized error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a failure with the login method it happened under.
    pub fn auth(method: LoginMethod, source: Error) -> Self {
        Error::Authentication {
            method,
            source: Box::new(source),
        }
    }

    /// True when the root cause is a missing record, unwrapping
    /// authentication wrappers.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Core(e) => e.is_not_found(),
            Error::Authentication { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The login method attached to an authentication error, if any.
    pub fn login_method(&self) -> Option<LoginMethod> {
        match self {
            Error::Authentication { method, .. } => Some(*method),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_unwraps_auth_wrapper() {
        let inner = Error::Core(sandpiper_core::Error::NotFound("user".into()));
        let err = Error::auth(LoginMethod::PublicKey, inner);
        assert!(err.is_not_found());
        assert_eq!(err.login_method(), Some(LoginMethod::PublicKey));

        let other = Error::auth(
            LoginMethod::Password,
            Error::Other("bad password".to_string()),
        );
        assert!(!other.is_not_found());
    }

    #[test]
    fn test_plain_errors_have_no_login_method() {
        assert_eq!(Error::Admission("banned".to_string()).login_method(), None);
    }
}
