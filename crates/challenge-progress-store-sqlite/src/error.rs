use challenge_progress_core::ProgressError;
use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot claim goal {goal_id} for user {user_id}: {reason}")]
    CannotClaim {
        user_id: String,
        goal_id: String,
        reason: &'static str,
    },
    #[error("transaction misuse: {0}")]
    TransactionMisuse(String),
    #[error("{operation} canceled before completion")]
    Canceled { operation: &'static str },
    #[error("connection pool failure during {operation}: {source}")]
    Pool {
        operation: &'static str,
        #[source]
        source: r2d2::Error,
    },
    #[error("database failure during {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ProgressError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Stable classification used by the CLI error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CannotClaim { .. } => "GOAL_NOT_CLAIMABLE",
            Self::TransactionMisuse(_) => "TRANSACTION_MISUSE",
            Self::Canceled { .. } => "CANCELED",
            Self::Pool { .. } => "POOL_EXHAUSTED",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Invalid(_) => "VALIDATION_FAILED",
        }
    }

    /// True when the request was understood but the row was not in a state that allows it.
    #[must_use]
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Self::CannotClaim { .. })
    }

    /// Busy database, exhausted pool and interrupted statements may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Canceled { .. } | Self::Pool { .. } => true,
            Self::Database { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            Self::CannotClaim { .. } | Self::TransactionMisuse(_) | Self::Invalid(_) => false,
        }
    }

    pub(crate) fn database(operation: &'static str, source: rusqlite::Error) -> Self {
        if source.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            tracing::warn!(operation, "statement interrupted by cancellation");
            return Self::Canceled { operation };
        }
        Self::Database { operation, source }
    }
}

/// Attaches the failing operation's name to a `rusqlite` result.
pub(crate) trait DuringOperation<T> {
    fn during(self, operation: &'static str) -> StoreResult<T>;
}

impl<T> DuringOperation<T> for rusqlite::Result<T> {
    fn during(self, operation: &'static str) -> StoreResult<T> {
        self.map_err(|source| StoreError::database(operation, source))
    }
}
