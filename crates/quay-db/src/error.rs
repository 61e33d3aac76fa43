use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to open or acquire a connection.
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to begin a transaction.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    /// Failed to commit a transaction.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    /// A query failed to execute.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl DbError {
    /// True when the error is the request being canceled rather than a
    /// database fault. Callers pass these through unchanged so clients can
    /// distinguish timeouts from server errors.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        match self {
            DbError::Connect(e) | DbError::Begin(e) | DbError::Commit(e) | DbError::Query(e) => {
                is_cancellation(e)
            }
        }
    }
}

/// Recognize PostgreSQL statement cancellation ("canceling statement due to
/// user request", SQLSTATE 57014) and driver-level interruptions.
#[must_use]
pub fn is_cancellation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("57014"),
        sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Io(io) => io.kind() == std::io::ErrorKind::Interrupted,
        _ => false,
    }
}
