use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("The transaction has been aborted. The unit of work was invalidated by an aborted scope")]
    TransactionAborted,

    #[error("Optimistic concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error(
        "The retry limit was reached while retrying because of an optimistic concurrency conflict ({attempts} attempts): {source}"
    )]
    RetryLimitExceeded {
        attempts: usize,
        #[source]
        source: Box<DbError>,
    },

    #[error(
        "The operation failed on commit. Since it is possible that the commit succeeded, potential retries were avoided: {0}"
    )]
    CommitFailed(#[source] Box<DbError>),

    #[error("Incompatible database context: {0}")]
    IncompatibleVersion(String),

    #[error("Cannot access a disposed object: {0}")]
    ObjectDisposed(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Multiple errors occurred: {}", join_errors(.0))]
    Multiple(Vec<DbError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Whether a plain transient-fault strategy may retry this error
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }

    /// Whether this is an optimistic concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DbError::ConcurrencyConflict(_))
    }

    /// Whether the outcome of a commit is unknown
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, DbError::CommitFailed(_))
    }

    /// Collapses a list of failures into a single error, if any
    pub(crate) fn aggregate(mut errors: Vec<DbError>) -> Option<DbError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(DbError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[DbError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
