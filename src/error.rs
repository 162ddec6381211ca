//! Error types for the tele-dl library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while queueing, transferring or reporting downloads.
#[derive(Error, Debug)]
pub enum Error {
    /// The transfer was interrupted by a network or source hiccup.
    #[error("transfer interrupted: {0}")]
    Transient(String),

    /// A single transport call exceeded its overall timeout.
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    /// The remote source asked us to back off for a mandatory period.
    #[error("rate limited by source, retry after {retry_after:?}")]
    RateLimited {
        /// Wait demanded by the source. Honored exactly.
        retry_after: Duration,
    },

    /// The transferred file failed post-download verification.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Credentials were rejected. Not retried; stops the manager.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Persisted stats could not be encoded or decoded.
    #[error("stats encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be read or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The manager stopped accepting new tasks.
    #[error("download manager is not accepting tasks: {0}")]
    NotAccepting(String),

    /// A batch received more distinct members than it declared.
    #[error("batch {batch} already has all {total} files")]
    BatchFull {
        /// Batch identifier.
        batch: String,
        /// Declared number of files.
        total: usize,
    },

    /// A batch's collection window is over and it accepts no more files.
    #[error("batch {0} is no longer collecting files")]
    BatchClosed(String),

    /// The notification sink rejected a message.
    #[error("notification failed: {0}")]
    Notify(String),

    /// The transfer was cancelled by a hard shutdown.
    #[error("download cancelled")]
    Cancelled,
}

/// How the retry policy treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with exponential backoff.
    Transient,
    /// Retried after the source-mandated wait.
    RateLimited,
    /// Retried at most once more.
    Verification,
    /// Never retried.
    Fatal,
    /// Shutdown in progress, never retried.
    Cancelled,
}

impl Error {
    /// Classifies this error for the retry policy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) | Self::Http(_) => {
                ErrorKind::Transient
            }
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Verification(_) => ErrorKind::Verification,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Auth(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::NotAccepting(_)
            | Self::BatchFull { .. }
            | Self::BatchClosed(_)
            | Self::Notify(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if this error must stop the whole manager, not just one task.
    #[must_use]
    pub const fn stops_manager(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// A specialized `Result` type for tele-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        assert_eq!(Error::Transient("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Transient);
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from(io).kind(), ErrorKind::Transient);
    }

    #[test]
    fn rate_limit_keeps_its_wait() {
        let err = Error::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.to_string().contains("42s"));
    }

    #[test]
    fn auth_is_fatal_and_stops_manager() {
        let err = Error::Auth("bad token".into());
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.stops_manager());
        assert!(!Error::Transient("x".into()).stops_manager());
    }
}
