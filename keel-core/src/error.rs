//! The error taxonomy shared by every store and handler.
//!
//! Callers branch on [`ErrorKind`] rather than on backend details: a
//! Postgres serialization failure and an in-memory expected-sequence
//! mismatch both surface as retryable, while a duplicate unique field is
//! always [`ErrorKind::AlreadyExists`].

use crate::concurrency::ConcurrencyConflict;

/// Boxed error source carried by the opaque variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    Conflict,
    Retryable,
    NotFound,
    Internal,
    DeadlineExceeded,
}

/// Errors returned by event stores, projection stores and handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed query, command or statement, or a reducer type mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A unique constraint already holds the requested field.
    #[error("already exists: {message}")]
    AlreadyExists {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    /// The aggregate moved past the sequence the caller decided on.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// The store kept aborting the transaction; retrying the whole push with
    /// the same input is safe.
    #[error("transaction aborted after {attempts} attempt(s): {source}")]
    Retryable {
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("not found: {0}")]
    NotFound(String),
    /// Storage or transport fault.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Retryable { .. } => ErrorKind::Retryable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    /// Whether re-running the same operation after reloading may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Retryable)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::internal("payload serialization failed", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_retryable_are_retryable() {
        let conflict = Error::from(ConcurrencyConflict {
            aggregate_type: "org".to_owned(),
            aggregate_id: "o1".to_owned(),
            expected: Some(1),
            actual: Some(2),
        });
        let aborted = Error::Retryable {
            attempts: 3,
            source: "could not serialize access".into(),
        };

        assert!(conflict.is_retryable());
        assert!(aborted.is_retryable());
        assert!(!Error::already_exists("taken").is_retryable());
        assert!(!Error::invalid_argument("bad").is_retryable());
    }

    #[test]
    fn already_exists_displays_caller_message() {
        let error = Error::already_exists("Errors.User.AlreadyExists");

        assert_eq!(error.kind(), ErrorKind::AlreadyExists);
        assert_eq!(error.to_string(), "already exists: Errors.User.AlreadyExists");
    }

    #[test]
    fn internal_keeps_source_chain() {
        let error = Error::internal("unable to filter events", std::io::Error::other("broken pipe"));

        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "broken pipe");
    }
}
