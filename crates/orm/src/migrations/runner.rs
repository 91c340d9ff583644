//! Migration Runner - Executes migrations against the database
//!
//! Applies pending migrations in id order, one transaction per migration,
//! and records each in the history table inside that same transaction.
//! A single apply runs at a time: an in-process gate plus a store advisory
//! lock, both taken without waiting.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::definitions::{Migration, MigrationHistory, MigrationRecord, MigrationStatus};
use super::operation::Operation;
use super::snapshot::{ColumnSchema, TableSchema};
use crate::backends::{
    DeleteStatement, InsertStatement, SelectColumn, SelectStatement, Statement,
};
use crate::connection::ConnectionPool;
use crate::error::{OrmError, OrmResult};
use crate::query::lookup::Lookup;
use crate::query::ordering::OrderTerm;
use crate::query::predicate::Predicate;
use crate::schema::FieldType;
use crate::transaction::Session;
use crate::value::{Row, Value};

/// Outcome of one `apply`
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRunResult {
    pub applied: Vec<u32>,
    /// Migrations already applied before this run
    pub skipped: usize,
    pub execution_time_ms: u128,
}

/// Migration runner that executes migrations through a pool
#[derive(Clone)]
pub struct MigrationRunner {
    pool: ConnectionPool,
    table: String,
    gate: Arc<Mutex<()>>,
}

impl MigrationRunner {
    /// Runner recording into the pool's configured history table
    pub fn new(pool: ConnectionPool) -> Self {
        let table = pool.config().migrations_table.clone();
        Self {
            pool,
            table,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn history_table(&self) -> &str {
        &self.table
    }

    /// Apply every pending migration of `history`.
    ///
    /// Stops at the first failure with `MigrationFailed`; migrations applied
    /// before it stay applied.
    pub async fn apply(&self, history: &MigrationHistory) -> OrmResult<MigrationRunResult> {
        let start = Instant::now();
        let (_gate, mut session, key) = self.lock().await?;
        let result = self.apply_locked(&mut session, history, start).await;
        self.unlock(&mut session, key).await;
        result
    }

    async fn apply_locked(
        &self,
        session: &mut Session,
        history: &MigrationHistory,
        start: Instant,
    ) -> OrmResult<MigrationRunResult> {
        self.ensure_history_table(session).await?;
        let applied = self.read_records(session).await?;
        let pending = pending_migrations(history, &applied)?;

        if pending.is_empty() {
            info!("No pending migrations");
        }

        let mut applied_ids = Vec::with_capacity(pending.len());
        for migration in pending {
            info!("Applying migration {}", migration.name());
            let id = migration.id;
            let operations = migration.operations.clone();
            let record = self.record_insert(id);

            let outcome = session
                .atomic(move |s| {
                    Box::pin(async move {
                        for operation in operations {
                            s.execute(&Statement::Schema(operation)).await?;
                        }
                        s.execute(&Statement::Insert(record)).await?;
                        Ok(())
                    })
                })
                .await;

            if let Err(e) = outcome {
                error!("Migration {} failed: {}", migration.name(), e);
                return Err(OrmError::MigrationFailed {
                    id,
                    source: Box::new(e),
                });
            }
            applied_ids.push(id);
        }

        let execution_time_ms = start.elapsed().as_millis();
        info!(
            "Applied {} migrations in {}ms",
            applied_ids.len(),
            execution_time_ms
        );
        Ok(MigrationRunResult {
            applied: applied_ids,
            skipped: applied.len(),
            execution_time_ms,
        })
    }

    /// Revert the most recently applied migration. Returns its id, or
    /// `None` when nothing is applied.
    pub async fn rollback_last(&self, history: &MigrationHistory) -> OrmResult<Option<u32>> {
        let (_gate, mut session, key) = self.lock().await?;
        let result = self.rollback_locked(&mut session, history).await;
        self.unlock(&mut session, key).await;
        result
    }

    async fn rollback_locked(
        &self,
        session: &mut Session,
        history: &MigrationHistory,
    ) -> OrmResult<Option<u32>> {
        if !session.table_exists(&self.table).await? {
            return Ok(None);
        }
        let Some(last) = self.read_records(session).await?.pop() else {
            return Ok(None);
        };
        let migration = history.get(last.id).ok_or_else(|| {
            OrmError::MigrationConflict(format!(
                "applied migration {:04} is missing from the history",
                last.id
            ))
        })?;

        info!("Rolling back migration {}", migration.name());
        let operations = migration.reverse_operations();
        let delete = Statement::Delete(DeleteStatement {
            table: self.table.clone(),
            predicate: Some(Predicate::compare("id", Lookup::Exact, i64::from(last.id))),
        });
        session
            .atomic(move |s| {
                Box::pin(async move {
                    for operation in operations {
                        s.execute(&Statement::Schema(operation)).await?;
                    }
                    s.execute(&delete).await?;
                    Ok(())
                })
            })
            .await
            .map_err(|e| OrmError::MigrationFailed {
                id: last.id,
                source: Box::new(e),
            })?;
        Ok(Some(last.id))
    }

    /// Records of applied migrations, by ascending id
    pub async fn applied(&self) -> OrmResult<Vec<MigrationRecord>> {
        let mut session = self.pool.acquire().await?;
        if !session.table_exists(&self.table).await? {
            return Ok(Vec::new());
        }
        self.read_records(&mut session).await
    }

    /// Migrations of `history` not yet applied, validated against the
    /// history table
    pub async fn pending(&self, history: &MigrationHistory) -> OrmResult<Vec<Migration>> {
        let applied = self.applied().await?;
        Ok(pending_migrations(history, &applied)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Status of each migration of `history`
    pub async fn status(&self, history: &MigrationHistory) -> OrmResult<Vec<(Migration, MigrationStatus)>> {
        let applied = self.applied().await?;
        Ok(history
            .migrations()
            .iter()
            .map(|m| {
                let status = applied
                    .iter()
                    .find(|r| r.id == m.id)
                    .map_or(MigrationStatus::Pending, |r| MigrationStatus::Applied {
                        applied_at: r.applied_at,
                    });
                (m.clone(), status)
            })
            .collect())
    }

    async fn lock(&self) -> OrmResult<(tokio::sync::MutexGuard<'_, ()>, Session, i64)> {
        let gate = self.gate.try_lock().map_err(|_| OrmError::ApplyInProgress)?;
        let mut session = self.pool.acquire().await?;
        let key = lock_key(&self.table);
        if !session.try_advisory_lock(key).await? {
            warn!("Migration lock on '{}' is held elsewhere", self.table);
            return Err(OrmError::ApplyInProgress);
        }
        Ok((gate, session, key))
    }

    async fn unlock(&self, session: &mut Session, key: i64) {
        if let Err(e) = session.advisory_unlock(key).await {
            warn!("Failed to release migration lock: {}", e);
        }
    }

    fn history_schema(&self) -> TableSchema {
        let mut id = ColumnSchema::new("id", FieldType::BigInteger).primary_key();
        id.auto_increment = false;
        TableSchema::new(self.table.clone())
            .column(id)
            .column(ColumnSchema::new("applied_at", FieldType::Timestamp))
    }

    async fn ensure_history_table(&self, session: &mut Session) -> OrmResult<()> {
        if session.table_exists(&self.table).await? {
            return Ok(());
        }
        info!("Creating migration history table '{}'", self.table);
        let create = Operation::CreateTable {
            table: self.history_schema(),
        };
        session.execute(&Statement::Schema(create)).await?;
        Ok(())
    }

    fn record_columns() -> Vec<SelectColumn> {
        vec![
            SelectColumn::new("id", FieldType::BigInteger),
            SelectColumn::new("applied_at", FieldType::Timestamp),
        ]
    }

    fn record_insert(&self, id: u32) -> InsertStatement {
        let mut values = Row::new();
        values.insert("id".to_string(), Value::Int(i64::from(id)));
        values.insert("applied_at".to_string(), Value::Timestamp(Utc::now()));
        InsertStatement {
            table: self.table.clone(),
            values,
            returning: Self::record_columns(),
        }
    }

    async fn read_records(&self, session: &mut Session) -> OrmResult<Vec<MigrationRecord>> {
        let select = SelectStatement::new(self.table.clone(), Self::record_columns())
            .order(vec![OrderTerm::asc("id")]);
        let rows = session.execute(&Statement::Select(select)).await?.rows;
        rows.iter()
            .map(|row| {
                let id = row
                    .get("id")
                    .and_then(Value::as_i64)
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| OrmError::Database("malformed migration record id".to_string()))?;
                let applied_at = match row.get("applied_at") {
                    Some(Value::Timestamp(ts)) => *ts,
                    _ => {
                        return Err(OrmError::Database(format!(
                            "migration record {:04} has no applied_at",
                            id
                        )))
                    }
                };
                Ok(MigrationRecord { id, applied_at })
            })
            .collect()
    }
}

/// Pending migrations in id order. Every applied id must exist in the
/// history, and nothing pending may precede an applied migration.
pub fn pending_migrations<'h>(
    history: &'h MigrationHistory,
    applied: &[MigrationRecord],
) -> OrmResult<Vec<&'h Migration>> {
    for record in applied {
        if history.get(record.id).is_none() {
            return Err(OrmError::MigrationConflict(format!(
                "applied migration {:04} is missing from the history",
                record.id
            )));
        }
    }
    let latest_applied = applied.iter().map(|r| r.id).max();
    let pending: Vec<&Migration> = history
        .migrations()
        .iter()
        .filter(|m| !applied.iter().any(|r| r.id == m.id))
        .collect();
    if let (Some(latest), Some(first)) = (latest_applied, pending.first()) {
        if first.id < latest {
            return Err(OrmError::MigrationConflict(format!(
                "migration {} is pending but {:04} is already applied",
                first.name(),
                latest
            )));
        }
    }
    Ok(pending)
}

/// Stable advisory lock key for a history table (64-bit FNV-1a)
fn lock_key(table: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in "strata-orm:migrations:".bytes().chain(table.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::snapshot::TableSchema;

    fn create(id: u32, table: &str) -> Migration {
        Migration::new(
            id,
            vec![Operation::CreateTable {
                table: TableSchema::new(table)
                    .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key()),
            }],
        )
    }

    fn record(id: u32) -> MigrationRecord {
        MigrationRecord {
            id,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_skips_applied() {
        let history = MigrationHistory::new(vec![create(1, "a"), create(2, "b")]).unwrap();
        let pending = pending_migrations(&history, &[record(1)]).unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_pending_rejects_gaps_and_unknown_records() {
        let history = MigrationHistory::new(vec![create(1, "a"), create(2, "b")]).unwrap();
        assert!(matches!(
            pending_migrations(&history, &[record(2)]),
            Err(OrmError::MigrationConflict(_))
        ));
        assert!(matches!(
            pending_migrations(&history, &[record(1), record(7)]),
            Err(OrmError::MigrationConflict(_))
        ));
    }

    #[test]
    fn test_lock_key_depends_on_table() {
        assert_eq!(lock_key("strata_migrations"), lock_key("strata_migrations"));
        assert_ne!(lock_key("strata_migrations"), lock_key("other"));
    }

    #[tokio::test]
    async fn test_apply_records_and_rolls_back() {
        let pool = ConnectionPool::connect(&crate::config::DatabaseConfig::default()).unwrap();
        let runner = MigrationRunner::new(pool.clone());
        let history = MigrationHistory::new(vec![create(1, "a"), create(2, "b")]).unwrap();

        let result = runner.apply(&history).await.unwrap();
        assert_eq!(result.applied, vec![1, 2]);
        assert_eq!(runner.apply(&history).await.unwrap().applied, Vec::<u32>::new());

        assert_eq!(runner.rollback_last(&history).await.unwrap(), Some(2));
        let mut session = pool.acquire().await.unwrap();
        assert!(session.table_exists("a").await.unwrap());
        assert!(!session.table_exists("b").await.unwrap());
        drop(session);

        let status = runner.status(&history).await.unwrap();
        assert!(matches!(status[0].1, MigrationStatus::Applied { .. }));
        assert_eq!(status[1].1, MigrationStatus::Pending);
    }

    #[tokio::test]
    async fn test_apply_refuses_while_gate_is_held() {
        let pool = ConnectionPool::connect(&crate::config::DatabaseConfig::default()).unwrap();
        let runner = MigrationRunner::new(pool);
        let history = MigrationHistory::new(vec![create(1, "a")]).unwrap();

        let held = runner.gate.try_lock().unwrap();
        assert!(matches!(runner.apply(&history).await, Err(OrmError::ApplyInProgress)));
        drop(held);
        assert_eq!(runner.apply(&history).await.unwrap().applied, vec![1]);
    }

    #[tokio::test]
    async fn test_apply_refuses_while_store_lock_is_held() {
        let pool = ConnectionPool::connect(&crate::config::DatabaseConfig::default()).unwrap();
        // A second runner stands in for another process sharing the store
        let runner = MigrationRunner::new(pool.clone());
        let history = MigrationHistory::new(vec![create(1, "a")]).unwrap();

        let mut other = pool.acquire().await.unwrap();
        let key = lock_key(runner.history_table());
        assert!(other.try_advisory_lock(key).await.unwrap());
        assert!(matches!(runner.apply(&history).await, Err(OrmError::ApplyInProgress)));

        other.advisory_unlock(key).await.unwrap();
        assert_eq!(runner.apply(&history).await.unwrap().applied, vec![1]);
    }
}
