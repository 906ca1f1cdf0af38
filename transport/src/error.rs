//! Error types for the transport layer.

use thiserror::Error;

/// Errors raised while setting up transports.
///
/// Connection-level failures are reported as plain [`std::io::Error`]s by the
/// [`crate::Transport`] and [`crate::ByteStream`] traits.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The address is not of the form `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => e,
            other @ TransportError::InvalidAddress(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string())
            }
        }
    }
}

/// Convenience result type for transport setup.
pub type Result<T> = std::result::Result<T, TransportError>;
