//! Common error types used throughout tunerflow.
//!
//! This module provides a unified error type that covers common failure cases
//! such as missing streams, invalid requests, unavailable devices, and I/O failures.

/// Common error type for tunerflow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested stream, job, or tuner was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input was provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A device or upstream service could not be used right now.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new Unavailable error.
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("stream abc");
        assert_eq!(err.to_string(), "Not found: stream abc");

        let err = Error::invalid_input("bad range");
        assert_eq!(err.to_string(), "Invalid input: bad range");

        let err = Error::unavailable("no free tuner");
        assert_eq!(err.to_string(), "Unavailable: no free tuner");

        let err = Error::internal("unexpected state");
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(Error::not_found("x"), Error::NotFound(_)));
        assert!(matches!(Error::invalid_input("x"), Error::InvalidInput(_)));
        assert!(matches!(Error::unavailable("x"), Error::Unavailable(_)));
        assert!(matches!(Error::internal("x"), Error::Internal(_)));
    }
}
