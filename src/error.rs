//! Error types for the chain notification engine.

use std::io;
use thiserror::Error;

/// Main error type for the chain notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Notifier is shutting down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors surfaced by a [`crate::chain::ChainBackend`] implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend's transaction index is not enabled. Callers fall back to
    /// scanning candidate blocks manually.
    #[error("Transaction index not available")]
    NoTxIndex,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors internal to the notification dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Out of order block connect: expected height {expected}, got {got}")]
    OutOfOrderConnect { expected: u32, got: u32 },

    #[error("Out of order block disconnect: expected height {expected}, got {got}")]
    OutOfOrderDisconnect { expected: u32, got: u32 },

    /// The common-ancestor walk exhausted the reorg safety depth. The
    /// notifier's view of the chain can no longer be reconciled.
    #[error("Chain reorganization exceeds safety depth of {depth} blocks")]
    ReorgTooDeep { depth: u32 },
}

/// Logging setup errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    Directory(#[source] io::Error),

    #[error("Failed to initialize logging: {0}")]
    Init(String),
}

/// Type alias for Result with NotifyError.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Type alias for backend operation results.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Type alias for dispatcher-internal results.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Type alias for logging setup results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::OutOfOrderConnect {
            expected: 101,
            got: 105,
        };
        assert!(err.to_string().contains("expected height 101"));
        assert!(err.to_string().contains("got 105"));

        let err = NotifyError::from(DispatchError::ReorgTooDeep {
            depth: 100,
        });
        assert!(err.to_string().contains("safety depth of 100"));
    }

    #[test]
    fn test_backend_error_conversion() {
        let err: NotifyError = BackendError::NoTxIndex.into();
        assert!(matches!(err, NotifyError::Backend(BackendError::NoTxIndex)));
    }
}
