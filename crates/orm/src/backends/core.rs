//! Core Database Backend Traits
//!
//! Stores receive structured statements rather than SQL text. The Postgres
//! backend renders them through `crate::sql`; the in-memory backend
//! interprets them directly.

use std::fmt;

use async_trait::async_trait;

use crate::error::OrmResult;
use crate::migrations::Operation;
use crate::query::ordering::OrderTerm;
use crate::query::predicate::Predicate;
use crate::schema::FieldType;
use crate::transaction::TransactionConfig;
use crate::value::Row;

/// Column to read, with the type used to decode it
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub name: String,
    pub field_type: FieldType,
}

impl SelectColumn {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// LEFT join of a to-one relationship. Joined columns come back keyed
/// `{alias}__{column}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub alias: String,
    pub table: String,
    pub columns: Vec<SelectColumn>,
    /// Column of the base table holding the foreign key
    pub local_column: String,
    /// Referenced column of the joined table
    pub target_column: String,
}

impl JoinSpec {
    pub fn key(&self, column: &str) -> String {
        format!("{}__{}", self.alias, column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Rows,
    /// A single row `{ "count": n }`; ordering, limit and offset are ignored
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub columns: Vec<SelectColumn>,
    pub joins: Vec<JoinSpec>,
    pub predicate: Option<Predicate>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub projection: Projection,
}

impl SelectStatement {
    pub fn new(table: impl Into<String>, columns: Vec<SelectColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
            joins: Vec::new(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            projection: Projection::Rows,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn order(mut self, terms: Vec<OrderTerm>) -> Self {
        self.order_by = terms;
        self
    }
}

/// Insert one row; the store answers with the full stored row
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Row,
    pub returning: Vec<SelectColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub values: Row,
    pub predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub predicate: Option<Predicate>,
}

/// Unit of work sent to a store
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Schema(Operation),
}

impl Statement {
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) if s.projection == Projection::Count => {
                write!(f, "COUNT {}", s.table)
            }
            Statement::Select(s) => write!(f, "SELECT {}", s.table),
            Statement::Insert(s) => write!(f, "INSERT {}", s.table),
            Statement::Update(s) => write!(f, "UPDATE {}", s.table),
            Statement::Delete(s) => write!(f, "DELETE {}", s.table),
            Statement::Schema(op) => write!(f, "DDL {}", op),
        }
    }
}

/// Rows produced and rows affected by one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub affected: u64,
}

impl QueryResult {
    pub fn rows(rows: Vec<Row>) -> Self {
        let affected = rows.len() as u64;
        Self { rows, affected }
    }

    pub fn affected(affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected,
        }
    }
}

/// One live connection to a store.
///
/// Transaction control is explicit: `begin` opens the outermost
/// transaction, savepoints nest inside it. `rollback_to_savepoint` also
/// discards the savepoint.
#[async_trait]
pub trait DatabaseConnection: Send {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<QueryResult>;

    async fn begin(&mut self, config: &TransactionConfig) -> OrmResult<()>;

    async fn commit(&mut self) -> OrmResult<()>;

    async fn rollback(&mut self) -> OrmResult<()>;

    async fn savepoint(&mut self, name: &str) -> OrmResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> OrmResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> OrmResult<()>;

    async fn table_exists(&mut self, table: &str) -> OrmResult<bool>;

    /// Non-blocking session-level advisory lock
    async fn try_advisory_lock(&mut self, key: i64) -> OrmResult<bool>;

    async fn advisory_unlock(&mut self, key: i64) -> OrmResult<()>;

    /// Abandon an open transaction without awaiting; used on drop paths
    fn discard_transaction(&mut self);
}

/// Factory of connections to one store
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> OrmResult<Box<dyn DatabaseConnection>>;
}
