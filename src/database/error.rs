use std::fmt;
use thiserror::Error;

pub type DbResult<T> = Result<T, DatabaseError>;

/// Storage-layer error with a retryability-aware kind split.
#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("row not found")]
    NotFound,

    #[error("unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    #[error("database timeout: {message}")]
    Timeout { message: String },

    #[error("database connection error: {message}")]
    Connection { message: String },

    #[error("query failed: {message}")]
    Query { message: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound,
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::Timeout {
                message: "connection pool acquire timed out".to_string(),
            },
            sqlx::Error::PoolClosed => DatabaseErrorKind::Connection {
                message: "connection pool closed".to_string(),
            },
            sqlx::Error::Io(e) => DatabaseErrorKind::Connection {
                message: e.to_string(),
            },
            sqlx::Error::Tls(e) => DatabaseErrorKind::Connection {
                message: e.to_string(),
            },
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    DatabaseErrorKind::Conflict {
                        constraint: db.constraint().unwrap_or("unique").to_string(),
                    }
                } else {
                    DatabaseErrorKind::Query {
                        message: db.to_string(),
                    }
                }
            }
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::Timeout { .. } | DatabaseErrorKind::Connection { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Conflict { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        let is_retryable = err.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable,
        }))
    }
}
