//! Sessions: one connection, one unit of work

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::savepoints::{AtomicToken, TransactionState};
use super::TransactionConfig;
use crate::backends::{DatabaseConnection, QueryResult, Statement};
use crate::connection::pool::PoolLease;
use crate::error::{OrmError, OrmResult};
use crate::relationships::BatchConfig;

/// A connection plus its transaction state.
///
/// Statements run sequentially through `&mut self`. A session dropped with
/// an open transaction discards it.
pub struct Session {
    conn: Box<dyn DatabaseConnection>,
    state: TransactionState,
    config: TransactionConfig,
    // Set when the open transaction was started read-only
    read_only: bool,
    batch: BatchConfig,
    // Declared last so the connection goes back before the permit does
    lease: Option<PoolLease>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Session over a bare connection, outside any pool
    pub fn new(conn: Box<dyn DatabaseConnection>) -> Self {
        Self {
            conn,
            state: TransactionState::new(),
            config: TransactionConfig::default(),
            read_only: false,
            batch: BatchConfig::default(),
            lease: None,
        }
    }

    pub(crate) fn leased(conn: Box<dyn DatabaseConnection>, lease: PoolLease, batch: BatchConfig) -> Self {
        Self {
            conn,
            state: TransactionState::new(),
            config: TransactionConfig::default(),
            read_only: false,
            batch,
            lease: Some(lease),
        }
    }

    /// Options for the next outermost transaction
    pub fn set_transaction_config(&mut self, config: TransactionConfig) {
        self.config = config;
    }

    pub fn set_batch_config(&mut self, batch: BatchConfig) {
        self.batch = batch;
    }

    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    pub fn transaction_state(&self) -> &TransactionState {
        &self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub async fn execute(&mut self, statement: &Statement) -> OrmResult<QueryResult> {
        if self.read_only && self.state.is_active() && statement.is_write() {
            return Err(OrmError::Transaction(format!(
                "cannot execute {} in a read-only transaction",
                statement
            )));
        }
        debug!("Executing {}", statement);
        self.conn.execute(statement).await
    }

    pub async fn table_exists(&mut self, table: &str) -> OrmResult<bool> {
        self.conn.table_exists(table).await
    }

    pub async fn try_advisory_lock(&mut self, key: i64) -> OrmResult<bool> {
        self.conn.try_advisory_lock(key).await
    }

    pub async fn advisory_unlock(&mut self, key: i64) -> OrmResult<()> {
        self.conn.advisory_unlock(key).await
    }

    /// Open a transaction, or a savepoint when one is already open
    pub async fn begin(&mut self) -> OrmResult<AtomicToken> {
        let token = self.state.plan();
        match token.savepoint() {
            None => {
                self.conn.begin(&self.config).await?;
                self.read_only = self.config.read_only;
                debug!("Transaction started");
            }
            Some(name) => {
                self.conn.savepoint(name).await?;
                debug!("Savepoint {} created", name);
            }
        }
        self.state.enter(&token);
        Ok(token)
    }

    /// Commit the innermost level; `token` must belong to it
    pub async fn commit(&mut self, token: AtomicToken) -> OrmResult<()> {
        self.state.check_top(&token)?;
        self.state.exit();
        match token.savepoint() {
            None => {
                self.conn.commit().await?;
                debug!("Transaction committed");
            }
            Some(name) => {
                self.conn.release_savepoint(name).await?;
                debug!("Savepoint {} released", name);
            }
        }
        Ok(())
    }

    /// Roll back the innermost level; `token` must belong to it
    pub async fn rollback(&mut self, token: AtomicToken) -> OrmResult<()> {
        self.state.check_top(&token)?;
        self.state.exit();
        match token.savepoint() {
            None => {
                self.conn.rollback().await?;
                debug!("Transaction rolled back");
            }
            Some(name) => {
                self.conn.rollback_to_savepoint(name).await?;
                debug!("Rolled back to savepoint {}", name);
            }
        }
        Ok(())
    }

    /// Roll back every open level
    pub async fn rollback_all(&mut self) -> OrmResult<()> {
        if !self.state.is_active() {
            return Ok(());
        }
        self.state.reset();
        self.conn.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Run `f` inside a transaction, or a savepoint when nested.
    ///
    /// `Ok` commits (or releases the savepoint). `Err` rolls back to where
    /// this call started and returns the closure's error unchanged.
    pub async fn atomic<T, F>(&mut self, f: F) -> OrmResult<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, OrmResult<T>> + Send,
    {
        let token = self.begin().await?;
        let depth = token.depth();
        let result = f(self).await;

        if self.state.depth() > depth {
            if let Err(e) = self.unwind_to(depth).await {
                if let Err(rollback_err) = self.rollback_all().await {
                    warn!("Rollback after failed unwind also failed: {}", rollback_err);
                }
                return Err(result.err().unwrap_or(e));
            }
        } else if self.state.depth() < depth {
            return Err(result.err().unwrap_or_else(|| {
                OrmError::Transaction("atomic block closed its own transaction".to_string())
            }));
        }

        match result {
            Ok(value) => {
                self.commit(token).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(token).await {
                    warn!("Rollback after failed atomic block also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Roll back levels a closure opened and left open
    async fn unwind_to(&mut self, depth: usize) -> OrmResult<()> {
        while self.state.depth() > depth {
            let Some(top) = self.state.top() else { break };
            warn!("Rolling back transaction level {} left open by an atomic block", top.depth());
            self.rollback(top).await?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.is_active() {
            warn!("Session dropped inside a transaction; rolling back");
            self.state.reset();
            self.conn.discard_transaction();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::backends::{DatabaseBackend, MemoryBackend};
    use crate::error::OrmError;
    use crate::migrations::{ColumnSchema, Operation, TableSchema};
    use crate::schema::FieldType;

    async fn session(backend: &MemoryBackend) -> Session {
        Session::new(backend.connect().await.unwrap())
    }

    #[tokio::test]
    async fn test_token_api_enforces_lifo() {
        let backend = MemoryBackend::new();
        let mut session = session(&backend).await;

        let outer = session.begin().await.unwrap();
        let inner = session.begin().await.unwrap();
        assert_eq!(inner.savepoint(), Some("sp_2_1"));

        let err = session.commit(outer).await.unwrap_err();
        assert!(matches!(err, OrmError::Transaction(_)));
        assert_eq!(session.transaction_state().depth(), 2);

        session.rollback(inner).await.unwrap();
        session.rollback_all().await.unwrap();
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_atomic_returns_closure_error_unchanged() {
        let backend = MemoryBackend::new();
        let mut session = session(&backend).await;

        let err = session
            .atomic(|_s| Box::pin(async { Err::<(), _>(OrmError::Validation("boom".into())) }))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(ref m) if m == "boom"));
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_nested_atomic_uses_savepoints() {
        let backend = MemoryBackend::new();
        let mut session = session(&backend).await;

        let depths = session
            .atomic(|s| {
                Box::pin(async move {
                    let outer = s.transaction_state().depth();
                    let inner = s
                        .atomic(|s| {
                            Box::pin(async move {
                                assert_eq!(s.transaction_state().savepoints().len(), 1);
                                Ok(s.transaction_state().depth())
                            })
                        })
                        .await?;
                    Ok((outer, inner))
                })
            })
            .await
            .unwrap();
        assert_eq!(depths, (1, 2));
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_atomic_unwinds_levels_left_open() {
        let backend = MemoryBackend::new();
        let mut session = session(&backend).await;

        session
            .atomic(|s| {
                Box::pin(async move {
                    let _leaked = s.begin().await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_read_only_transaction_rejects_writes() {
        let backend = MemoryBackend::new();
        let mut session = session(&backend).await;
        let create = Statement::Schema(Operation::CreateTable {
            table: TableSchema::new("notes")
                .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key()),
        });

        session.set_transaction_config(TransactionConfig::read_only());
        session.begin().await.unwrap();
        let err = session.execute(&create).await.unwrap_err();
        assert!(matches!(err, OrmError::Transaction(_)));
        session.rollback_all().await.unwrap();

        session.execute(&create).await.unwrap();
        assert!(session.table_exists("notes").await.unwrap());
    }

    /// Connection whose savepoints cannot be rolled back
    struct LostSavepoints {
        rolled_back: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DatabaseConnection for LostSavepoints {
        async fn execute(&mut self, _statement: &Statement) -> OrmResult<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn begin(&mut self, _config: &TransactionConfig) -> OrmResult<()> {
            Ok(())
        }

        async fn commit(&mut self) -> OrmResult<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> OrmResult<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Err(OrmError::Connection("connection reset".into()))
        }

        async fn savepoint(&mut self, _name: &str) -> OrmResult<()> {
            Ok(())
        }

        async fn release_savepoint(&mut self, _name: &str) -> OrmResult<()> {
            Ok(())
        }

        async fn rollback_to_savepoint(&mut self, name: &str) -> OrmResult<()> {
            Err(OrmError::Database(format!("savepoint \"{}\" does not exist", name)))
        }

        async fn table_exists(&mut self, _table: &str) -> OrmResult<bool> {
            Ok(false)
        }

        async fn try_advisory_lock(&mut self, _key: i64) -> OrmResult<bool> {
            Ok(true)
        }

        async fn advisory_unlock(&mut self, _key: i64) -> OrmResult<()> {
            Ok(())
        }

        fn discard_transaction(&mut self) {}
    }

    #[tokio::test]
    async fn test_failed_unwind_rolls_back_whole_transaction() {
        let rolled_back = Arc::new(AtomicBool::new(false));
        let mut session = Session::new(Box::new(LostSavepoints {
            rolled_back: rolled_back.clone(),
        }));

        let err = session
            .atomic(|s| {
                Box::pin(async move {
                    let _leaked = s.begin().await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Database(_)));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(!session.in_transaction());
    }
}
