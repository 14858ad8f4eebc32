use thiserror::Error;

/// Main error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry not found")]
    NotFound,

    #[error("stored entry does not match its type discriminant: {0}")]
    TypeMismatch(String),

    #[error("database is busy")]
    Busy,

    #[error("timed out waiting for stampede barrier")]
    Timeout,

    #[error("cache corruption: {0}")]
    Corruption(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                CacheError::Busy
            }
            other => CacheError::Database(other),
        }
    }
}

impl CacheError {
    /// True for transient contention errors that callers may retry
    pub fn is_busy(&self) -> bool {
        matches!(self, CacheError::Busy | CacheError::Timeout)
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
