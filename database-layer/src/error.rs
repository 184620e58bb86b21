use thiserror::Error;

use crate::migration::Direction;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Failures while building the migration registry or applying it.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration version {0} is registered more than once")]
    DuplicateVersion(i64),

    #[error("Migration version {0} is not a positive integer")]
    InvalidVersion(i64),

    #[error(
        "Migration {version} ({direction}) failed at statement `{statement}`: {reason}; \
         last committed version is {last_committed}"
    )]
    StatementFailed {
        version: i64,
        direction: Direction,
        statement: String,
        last_committed: i64,
        reason: String,
    },

    #[error("Migration {version} could not be committed: {reason}; last committed version is {last_committed}")]
    Transaction {
        version: i64,
        last_committed: i64,
        reason: String,
    },

    #[error("Migration lock error: {0}")]
    Lock(String),

    #[error("Schema version marker error: {0}")]
    Marker(String),
}

impl MigrationError {
    /// The schema version persisted when the failure happened, if known.
    pub fn last_committed(&self) -> Option<i64> {
        match self {
            MigrationError::StatementFailed { last_committed, .. }
            | MigrationError::Transaction { last_committed, .. } => Some(*last_committed),
            _ => None,
        }
    }
}

pub type MigrationResult<T> = Result<T, MigrationError>;
