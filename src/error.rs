use thiserror::Error;

/// Custom error type for the database core operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt WAL record at offset {offset}: {details}")]
    CorruptWal { offset: u64, details: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Series id collision: id {id:#018x} already maps to metric \"{existing}\"")]
    SeriesCollision { id: u64, existing: String },

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
