//! Error types shared across the pipeline seams

use thiserror::Error;

/// The queue could not be reached or rejected a command.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unreachable: {0}")]
    Unavailable(String),
    #[error("queue operation timed out after {0} ms")]
    Timeout(u64),
    #[error("queue protocol error: {0}")]
    Protocol(String),
    /// Partition holds its configured maximum of unacknowledged entries.
    #[error("queue partition is full ({0} entries)")]
    Full(u64),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            QueueError::Unavailable(err.to_string())
        } else {
            QueueError::Protocol(err.to_string())
        }
    }
}

/// Store failures split by whether a retry can help.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| is_transient_sqlstate(&code))
                .unwrap_or(false),
            _ => false,
        };
        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Fatal(err.to_string())
        }
    }
}

/// Connection exceptions, insufficient resources, operator intervention,
/// serialization failures and deadlocks are worth retrying.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57")
        || code == "40001"
        || code == "40P01"
}

/// A consumed payload does not describe a valid trap event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload does not match the trap schema: {0}")]
    Schema(String),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("varbind_count is {declared} but {actual} varbinds are present")]
    BindingCountMismatch { declared: usize, actual: usize },
}

/// Both the queue and the fallback log refused the event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialise trap event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue unavailable ({queue}) and fallback log failed ({fallback})")]
    Unavailable { queue: String, fallback: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classes() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("53300"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
