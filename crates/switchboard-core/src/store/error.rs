use thiserror::Error;

/// Error kinds surfaced by the store engine.
///
/// Validation and type errors are fatal to the operation but never retried.
/// Writer-lock contention is retried internally and only escapes as
/// [`StoreError::WriteLock`] once the retries are exhausted. Corruption is
/// degraded-mode behavior: it is logged at the point of discovery and the
/// raw value is returned instead of failing the whole read.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("type mismatch for field '{field}' in store '{store}': {message}")]
    TypeMismatch {
        store: String,
        field: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("write lock unavailable: {0}")]
    WriteLock(String),

    #[error("corrupt stored data: {0}")]
    Corruption(String),

    #[error("store is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True when the underlying database reported SQLITE_BUSY, i.e. the
    /// writer lock is held elsewhere and the operation may be retried.
    pub fn is_locked(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => {
                db.message().to_lowercase().contains("database is locked")
                    || db.code().map(|c| c == "5").unwrap_or(false)
            }
            _ => false,
        }
    }
}
