//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("decode error: {0}")]
    Decode(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for jobforge_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => jobforge_core::Error::NotFound(msg),
            other => jobforge_core::Error::Store(other.to_string()),
        }
    }
}
