//! Error types for the library

use thiserror::Error;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the library
#[derive(Error, Debug)]
pub enum Error {
    /// Transport could not be established (timeout, refused, resolution)
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Transport lost while the operation was in flight
    #[error("disconnected")]
    Disconnected,

    /// Request deadline exceeded while the transport stayed up
    #[error("request timed out")]
    Timeout,

    /// Malformed frame or unparseable JSON; non-fatal for the session
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device answered with an error object
    #[error("command rejected by device (code {code}): {message}")]
    CommandRejected {
        /// Device error code, verbatim
        code: i64,
        /// Device error message, verbatim
        message: String,
    },

    /// A bounded queue stayed full beyond its timeout
    #[error("overloaded: write queue full")]
    Overloaded,

    /// Caller-initiated shutdown aborted the request
    #[error("cancelled")]
    Cancelled,

    /// IO errors (network, socket shutdown, ...)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors the session recovers from without tearing down
    /// (the request fails, the connection stays).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Protocol(_) | Error::CommandRejected { .. } | Error::Overloaded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::CommandRejected {
            code: 215,
            message: "target below horizon".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command rejected by device (code 215): target below horizon"
        );
        assert_eq!(Error::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Timeout.is_recoverable());
        assert!(Error::Protocol("x".into()).is_recoverable());
        assert!(!Error::Disconnected.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
        assert!(!Error::ConnectFailed("refused".into()).is_recoverable());
    }
}
