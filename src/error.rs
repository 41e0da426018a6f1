//! Error types for grid-broker operations.
//!
//! Only genuine failures live here. The normal negative outcomes of matching
//! ("nothing to run", "install these packages"), stale status updates and
//! exceeded quotas are plain values of their components' result types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the task queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A statement did not finish within its time bound.
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The store could not be reached.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A statement was rejected by the store.
    #[error("Query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A referenced row does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] crate::storage::migrations::MigrationError),
}

impl StoreError {
    /// Transient failures are surfaced to the caller as retryable; the core
    /// never retries them itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Query(other),
        }
    }
}

/// Errors raised by the token issuance service.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Token service unreachable: {0}")]
    Unreachable(String),

    #[error("Token request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Malformed token response: {0}")]
    Malformed(String),

    #[error("Token revocation failed: {0}")]
    RevocationFailed(String),
}

/// Errors raised by the site directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Site directory unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load site directory from '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors returned by the job broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The job was claimed but no usable credential could be issued; the
    /// claim has been rolled back to a failure status.
    #[error("Credential issuance failed for job {queue_id}: {source}")]
    CredentialIssuance {
        queue_id: i64,
        #[source]
        source: CredentialError,
    },

    #[error("Invalid match request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Store(e) => e.is_transient(),
            BrokerError::Directory(DirectoryError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

/// Errors returned when dispatching a front-door command.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The worker pool is not accepting commands.
    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Short, stable code for the agent-facing response.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Broker(e) if e.is_transient() => "transient",
            DispatchError::Store(e) if e.is_transient() => "transient",
            DispatchError::Broker(BrokerError::CredentialIssuance { .. }) => "credential",
            DispatchError::Broker(_) | DispatchError::Store(_) => "internal",
            DispatchError::InvalidCommand(_) => "invalid",
            DispatchError::ShuttingDown => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = StoreError::Timeout {
            operation: "claim_waiting_job",
            timeout: Duration::from_secs(120),
        };
        assert!(timeout.is_transient());
        assert!(timeout.to_string().contains("claim_waiting_job"));

        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::NotFound("job 1".to_string()).is_transient());
    }

    #[test]
    fn test_broker_error_transience_follows_store() {
        let err = BrokerError::from(StoreError::Connection("refused".to_string()));
        assert!(err.is_transient());

        let err = BrokerError::CredentialIssuance {
            queue_id: 7,
            source: CredentialError::Unreachable("down".to_string()),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_dispatch_error_codes() {
        let err = DispatchError::from(StoreError::Connection("refused".to_string()));
        assert_eq!(err.code(), "transient");

        let err = DispatchError::from(BrokerError::CredentialIssuance {
            queue_id: 1,
            source: CredentialError::Malformed("empty".to_string()),
        });
        assert_eq!(err.code(), "credential");

        assert_eq!(DispatchError::ShuttingDown.code(), "unavailable");
        assert_eq!(DispatchError::InvalidCommand("x".to_string()).code(), "invalid");
    }
}
