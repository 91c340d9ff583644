//! Transaction Management
//!
//! Transactions are scoped to a `Session`. `Session::atomic` is the usual
//! entry point; nested calls become savepoints. The token API underneath
//! (`begin` / `commit` / `rollback`) enforces strict LIFO nesting.

mod savepoints;
mod session;

pub use savepoints::{AtomicToken, TransactionState};
pub use session::Session;

/// Transaction isolation levels supported by PostgreSQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// Default PostgreSQL isolation level
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options applied when the outermost transaction begins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    /// `None` keeps the store default
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TransactionConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn serializable() -> Self {
        Self {
            isolation_level: Some(IsolationLevel::Serializable),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(
            TransactionConfig::serializable().isolation_level,
            Some(IsolationLevel::Serializable)
        );
        assert!(TransactionConfig::read_only().read_only);
        assert_eq!(TransactionConfig::default().isolation_level, None);
    }
}
