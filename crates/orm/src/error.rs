//! Error types for the ORM system
//!
//! One error enum covers the whole data-mapping layer: schema declaration,
//! migrations, query building, relationship loading, execution and pooling.
//! Absence of a row is never an error here; reads return `Option`.

use std::fmt;
use std::time::Duration;

/// Result type alias for ORM operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Which store-level constraint rejected a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    UniqueTogether,
    ForeignKey,
    NotNull,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::PrimaryKey => write!(f, "primary key"),
            ConstraintKind::Unique => write!(f, "unique"),
            ConstraintKind::UniqueTogether => write!(f, "unique-together"),
            ConstraintKind::ForeignKey => write!(f, "foreign key"),
            ConstraintKind::NotNull => write!(f, "not-null"),
        }
    }
}

/// Error types for ORM operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrmError {
    /// Malformed or unresolvable model descriptor
    #[error("Schema error: {0}")]
    Schema(String),

    /// Replayed migration history cannot be reconciled
    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    /// A pending migration failed; earlier migrations stay committed
    #[error("Migration {id:04} failed: {source}")]
    MigrationFailed {
        id: u32,
        #[source]
        source: Box<OrmError>,
    },

    /// Another apply holds the migration gate
    #[error("Migration apply already in progress")]
    ApplyInProgress,

    /// Unknown lookup, unknown field or ill-typed filter value
    #[error("Query error: {0}")]
    Query(String),

    /// Invalid use of a relationship (join on a collection, unloaded access)
    #[error("Relationship error: {0}")]
    Relationship(String),

    /// Store rejected a write
    #[error("{kind} constraint violated on '{table}': {detail}")]
    ConstraintViolation {
        kind: ConstraintKind,
        table: String,
        detail: String,
    },

    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted after waiting {timeout:?}")]
    PoolExhausted { timeout: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Invalid input to a write (unknown field, primary key change)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl OrmError {
    pub(crate) fn constraint(
        kind: ConstraintKind,
        table: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        OrmError::ConstraintViolation {
            kind,
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// True for violations of unique, foreign key or not-null constraints
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, OrmError::ConstraintViolation { .. })
    }

    /// True when retrying acquisition may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, OrmError::Connection(_))
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let table = db.table().unwrap_or_default().to_string();
                let detail = db
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| db.message().to_string());
                match db.kind() {
                    sqlx::error::ErrorKind::UniqueViolation => {
                        OrmError::constraint(ConstraintKind::Unique, table, detail)
                    }
                    sqlx::error::ErrorKind::ForeignKeyViolation => {
                        OrmError::constraint(ConstraintKind::ForeignKey, table, detail)
                    }
                    sqlx::error::ErrorKind::NotNullViolation => {
                        OrmError::constraint(ConstraintKind::NotNull, table, detail)
                    }
                    _ => OrmError::Database(db.message().to_string()),
                }
            }
            sqlx::Error::PoolTimedOut => OrmError::PoolExhausted {
                timeout: Duration::ZERO,
            },
            sqlx::Error::Io(e) => OrmError::Connection(e.to_string()),
            sqlx::Error::Tls(e) => OrmError::Connection(e.to_string()),
            sqlx::Error::PoolClosed => OrmError::Connection("pool is closed".to_string()),
            other => OrmError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OrmError {
    fn from(err: std::io::Error) -> Self {
        OrmError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violation_display() {
        let err = OrmError::constraint(ConstraintKind::UniqueTogether, "post_tags", "(post_id, tag_id)");
        assert_eq!(
            err.to_string(),
            "unique-together constraint violated on 'post_tags': (post_id, tag_id)"
        );
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_migration_failed_keeps_source() {
        let err = OrmError::MigrationFailed {
            id: 3,
            source: Box::new(OrmError::Database("boom".to_string())),
        };
        assert_eq!(err.to_string(), "Migration 0003 failed: Database error: boom");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Database error: boom"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(OrmError::Connection("reset".into()).is_transient());
        assert!(!OrmError::Query("bad".into()).is_transient());
    }
}
