/// Error type for `PostgreSQL` store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored value does not fit the type keel exposes.
    #[error("invalid {column} value from database: {value}")]
    InvalidValue { column: &'static str, value: i64 },
    /// An insert returned fewer rows than it wrote.
    #[error("database did not return the inserted rows")]
    MissingReturnedRow,
    /// A notification payload could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The write was refused for a domain reason (duplicate unique
    /// constraint, stale expected sequence, invalid statement).
    #[error(transparent)]
    Rejected(keel_core::error::Error),
}

/// SQLSTATE `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

impl Error {
    /// Whether retrying the whole transaction may succeed.
    ///
    /// Serialization failures and deadlocks are transient. A unique
    /// violation on the event sequence keys means a concurrent writer took
    /// the same sequence and is transient too; unique violations elsewhere
    /// are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let Self::Database(sqlx::Error::Database(error)) = self else {
            return false;
        };
        match error.code().as_deref() {
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => true,
            Some(UNIQUE_VIOLATION) => error.table() == Some("keel_events"),
            _ => false,
        }
    }

    /// A unique violation outside the event sequence keys, such as a
    /// projection row colliding with an existing primary key.
    fn is_duplicate(&self) -> bool {
        let Self::Database(sqlx::Error::Database(error)) = self else {
            return false;
        };
        error.code().as_deref() == Some(UNIQUE_VIOLATION) && !self.is_transient()
    }

    pub(crate) fn invalid_value(column: &'static str, value: i64) -> Self {
        Self::InvalidValue { column, value }
    }
}

impl From<keel_core::error::Error> for Error {
    fn from(error: keel_core::error::Error) -> Self {
        Self::Rejected(error)
    }
}

impl From<Error> for keel_core::error::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Rejected(error) => error,
            error if error.is_transient() => Self::Retryable {
                attempts: 1,
                source: Box::new(error),
            },
            error if error.is_duplicate() => Self::AlreadyExists {
                message: "duplicate key".to_owned(),
                source: Some(Box::new(error)),
            },
            error => Self::internal("postgres store failure", error),
        }
    }
}

/// Convert a stored `BIGINT` into the unsigned counter keel exposes.
pub(crate) fn to_u64(column: &'static str, value: i64) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| Error::invalid_value(column, value))
}

/// Convert an unsigned counter into a `BIGINT` bind value.
pub(crate) fn to_i64(column: &'static str, value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::invalid_value(column, i64::MAX))
}

#[cfg(test)]
mod tests {
    use keel_core::error::ErrorKind;

    use super::*;

    #[test]
    fn rejected_errors_pass_through_unchanged() {
        let error: keel_core::error::Error =
            Error::Rejected(keel_core::error::Error::already_exists("name taken")).into();

        assert_eq!(error.kind(), ErrorKind::AlreadyExists);
        assert_eq!(error.to_string(), "already exists: name taken");
    }

    #[test]
    fn connection_failures_are_internal() {
        let error: keel_core::error::Error = Error::Database(sqlx::Error::PoolTimedOut).into();

        assert_eq!(error.kind(), ErrorKind::Internal);
        assert!(!error.is_retryable());
    }

    #[test]
    fn negative_counters_are_rejected() {
        assert!(matches!(
            to_u64("sequence", -1),
            Err(Error::InvalidValue {
                column: "sequence",
                value: -1
            })
        ));
        assert_eq!(to_u64("sequence", 7).unwrap(), 7);
        assert!(to_i64("sequence", u64::MAX).is_err());
    }
}
