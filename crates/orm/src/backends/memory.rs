//! In-process reference store
//!
//! Executes statements against tables held in memory and enforces the same
//! rules a relational store does: typed columns, auto-increment keys,
//! storage defaults, not-null, primary key, unique, unique-together and
//! foreign-key constraints, cascade and restrict deletes.
//!
//! Every statement runs against a copy of the state that replaces the
//! original only on success. A transaction holds the store lock from
//! `begin` to `commit`/`rollback`, so transactions are serialized and
//! statements from other connections wait for them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::core::{
    DatabaseBackend, DatabaseConnection, DeleteStatement, InsertStatement, Projection,
    QueryResult, SelectStatement, Statement, UpdateStatement,
};
use crate::error::{ConstraintKind, OrmError, OrmResult};
use crate::migrations::{ColumnSchema, ConstraintSchema, NamedConstraint, Operation, SchemaSnapshot, TableSchema};
use crate::query::ordering::OrderTerm;
use crate::query::predicate::Predicate;
use crate::schema::{FieldType, OnDelete};
use crate::transaction::TransactionConfig;
use crate::value::{Row, Value};

#[derive(Debug, Clone)]
struct MemoryTable {
    rows: Vec<Row>,
    next_id: i64,
}

impl MemoryTable {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    schema: SchemaSnapshot,
    tables: BTreeMap<String, MemoryTable>,
}

/// In-memory store shared by every connection it hands out
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<StdMutex<HashSet<i64>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatabaseBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            locks: self.locks.clone(),
            held_locks: HashSet::new(),
            transaction: None,
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    begin_state: MemoryState,
    savepoints: Vec<(String, MemoryState)>,
    read_only: bool,
}

pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<StdMutex<HashSet<i64>>>,
    held_locks: HashSet<i64>,
    transaction: Option<MemoryTransaction>,
}

impl MemoryConnection {
    fn transaction(&mut self) -> OrmResult<&mut MemoryTransaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| OrmError::Transaction("no transaction in progress".to_string()))
    }

    fn savepoint_position(tx: &MemoryTransaction, name: &str) -> OrmResult<usize> {
        tx.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| OrmError::Transaction(format!("savepoint \"{}\" does not exist", name)))
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<QueryResult> {
        if let Statement::Select(select) = statement {
            return match &self.transaction {
                Some(tx) => tx.guard.select(select),
                None => self.state.lock().await.select(select),
            };
        }

        match self.transaction.as_mut() {
            Some(tx) => {
                if tx.read_only {
                    return Err(OrmError::Database(format!(
                        "cannot execute {} in a read-only transaction",
                        statement
                    )));
                }
                let mut working = (*tx.guard).clone();
                let result = working.apply(statement)?;
                *tx.guard = working;
                Ok(result)
            }
            None => {
                let mut guard = self.state.lock().await;
                let mut working = (*guard).clone();
                let result = working.apply(statement)?;
                *guard = working;
                Ok(result)
            }
        }
    }

    async fn begin(&mut self, config: &TransactionConfig) -> OrmResult<()> {
        if self.transaction.is_some() {
            return Err(OrmError::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        let guard = self.state.clone().lock_owned().await;
        let begin_state = (*guard).clone();
        self.transaction = Some(MemoryTransaction {
            guard,
            begin_state,
            savepoints: Vec::new(),
            read_only: config.read_only,
        });
        Ok(())
    }

    async fn commit(&mut self) -> OrmResult<()> {
        match self.transaction.take() {
            Some(_) => Ok(()),
            None => Err(OrmError::Transaction("no transaction in progress".to_string())),
        }
    }

    async fn rollback(&mut self) -> OrmResult<()> {
        match self.transaction.take() {
            Some(MemoryTransaction {
                mut guard,
                begin_state,
                ..
            }) => {
                *guard = begin_state;
                Ok(())
            }
            None => Err(OrmError::Transaction("no transaction in progress".to_string())),
        }
    }

    async fn savepoint(&mut self, name: &str) -> OrmResult<()> {
        let tx = self.transaction()?;
        let snapshot = (*tx.guard).clone();
        tx.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> OrmResult<()> {
        let tx = self.transaction()?;
        let position = Self::savepoint_position(tx, name)?;
        tx.savepoints.truncate(position);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> OrmResult<()> {
        let tx = self.transaction()?;
        let position = Self::savepoint_position(tx, name)?;
        let (_, snapshot) = tx.savepoints.swap_remove(position);
        tx.savepoints.truncate(position);
        *tx.guard = snapshot;
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> OrmResult<bool> {
        Ok(match &self.transaction {
            Some(tx) => tx.guard.schema.contains_table(table),
            None => self.state.lock().await.schema.contains_table(table),
        })
    }

    async fn try_advisory_lock(&mut self, key: i64) -> OrmResult<bool> {
        if self.held_locks.contains(&key) {
            return Ok(true);
        }
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.insert(key) {
            self.held_locks.insert(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn advisory_unlock(&mut self, key: i64) -> OrmResult<()> {
        if self.held_locks.remove(&key) {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.remove(&key);
        }
        Ok(())
    }

    fn discard_transaction(&mut self) {
        if let Some(MemoryTransaction {
            mut guard,
            begin_state,
            ..
        }) = self.transaction.take()
        {
            *guard = begin_state;
            debug!("Discarded open in-memory transaction");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.discard_transaction();
        if !self.held_locks.is_empty() {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            for key in self.held_locks.drain() {
                locks.remove(&key);
            }
        }
    }
}

fn missing_relation(table: &str) -> OrmError {
    OrmError::Database(format!("relation \"{}\" does not exist", table))
}

fn missing_column(table: &str, column: &str) -> OrmError {
    OrmError::Database(format!(
        "column \"{}\" of relation \"{}\" does not exist",
        column, table
    ))
}

impl MemoryState {
    fn schema_of(&self, table: &str) -> OrmResult<&TableSchema> {
        self.schema.table(table).ok_or_else(|| missing_relation(table))
    }

    fn rows_of(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(|t| t.rows.as_slice()).unwrap_or(&[])
    }

    fn apply(&mut self, statement: &Statement) -> OrmResult<QueryResult> {
        match statement {
            Statement::Select(select) => self.select(select),
            Statement::Insert(insert) => self.insert(insert),
            Statement::Update(update) => self.update(update),
            Statement::Delete(delete) => self.delete(delete),
            Statement::Schema(operation) => self.apply_schema(operation),
        }
    }

    fn select(&self, select: &SelectStatement) -> OrmResult<QueryResult> {
        let schema = self.schema_of(&select.table)?;
        for column in &select.columns {
            if schema.get_column(&column.name).is_none() {
                return Err(missing_column(&select.table, &column.name));
            }
        }

        let mut rows: Vec<&Row> = self
            .rows_of(&select.table)
            .iter()
            .filter(|row| select.predicate.as_ref().map_or(true, |p| p.matches(row)))
            .collect();

        if select.projection == Projection::Count {
            let mut row = Row::new();
            row.insert("count".to_string(), Value::Int(rows.len() as i64));
            return Ok(QueryResult::rows(vec![row]));
        }

        rows.sort_by(|a, b| order_rows(a, b, &select.order_by));

        let offset = select.offset.unwrap_or(0) as usize;
        let limit = select.limit.map_or(usize::MAX, |l| l as usize);
        let mut output = Vec::new();
        for row in rows.into_iter().skip(offset).take(limit) {
            let mut projected = Row::new();
            for column in &select.columns {
                let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
                projected.insert(column.name.clone(), value);
            }
            for join in &select.joins {
                let key = row.get(&join.local_column).unwrap_or(&Value::Null);
                let target = self
                    .rows_of(&join.table)
                    .iter()
                    .find(|t| t.get(&join.target_column).is_some_and(|v| v.sql_eq(key)));
                for column in &join.columns {
                    let value = target
                        .and_then(|t| t.get(&column.name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    projected.insert(join.key(&column.name), value);
                }
            }
            output.push(projected);
        }
        Ok(QueryResult::rows(output))
    }

    fn insert(&mut self, insert: &InsertStatement) -> OrmResult<QueryResult> {
        let schema = self.schema_of(&insert.table)?.clone();
        for column in insert.values.keys() {
            if schema.get_column(column).is_none() {
                return Err(missing_column(&insert.table, column));
            }
        }

        let table = self
            .tables
            .entry(insert.table.clone())
            .or_insert_with(MemoryTable::new);
        let mut row = Row::new();
        for column in &schema.columns {
            let value = match insert.values.get(&column.name) {
                Some(value) => typed(&insert.table, column, value.clone())?,
                None if column.auto_increment => {
                    let id = table.next_id;
                    table.next_id += 1;
                    Value::Int(id)
                }
                None => match &column.db_default {
                    Some(expression) => eval_default(expression, column.field_type)?,
                    None => Value::Null,
                },
            };
            if column.auto_increment {
                if let Value::Int(id) = value {
                    table.next_id = table.next_id.max(id + 1);
                }
            }
            row.insert(column.name.clone(), value);
        }

        self.check_row(&schema, &row, None)?;
        if let Some(table) = self.tables.get_mut(&insert.table) {
            table.rows.push(row.clone());
        }
        Ok(QueryResult::rows(vec![row]))
    }

    fn update(&mut self, update: &UpdateStatement) -> OrmResult<QueryResult> {
        let schema = self.schema_of(&update.table)?.clone();
        let mut values = Row::new();
        for (name, value) in &update.values {
            let column = schema
                .get_column(name)
                .ok_or_else(|| missing_column(&update.table, name))?;
            values.insert(name.clone(), typed(&update.table, column, value.clone())?);
        }

        let targets: Vec<usize> = self
            .rows_of(&update.table)
            .iter()
            .enumerate()
            .filter(|(_, row)| update.predicate.as_ref().map_or(true, |p| p.matches(row)))
            .map(|(i, _)| i)
            .collect();

        for &index in &targets {
            let old = self.rows_of(&update.table)[index].clone();
            let mut new = old.clone();
            for (name, value) in &values {
                new.insert(name.clone(), value.clone());
            }
            self.check_row(&schema, &new, Some(index))?;
            self.check_referenced_keys(&schema, &old, &new)?;
            if let Some(table) = self.tables.get_mut(&update.table) {
                table.rows[index] = new;
            }
        }
        Ok(QueryResult::affected(targets.len() as u64))
    }

    fn delete(&mut self, delete: &DeleteStatement) -> OrmResult<QueryResult> {
        self.schema_of(&delete.table)?;
        let affected = self.delete_where(&delete.table, delete.predicate.as_ref())?;
        Ok(QueryResult::affected(affected))
    }

    /// Remove matching rows, then cascade (or refuse) through every foreign
    /// key pointing at them, depth-first
    fn delete_where(&mut self, table: &str, predicate: Option<&Predicate>) -> OrmResult<u64> {
        let Some(storage) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut storage.rows)
            .into_iter()
            .partition(|row| predicate.map_or(true, |p| p.matches(row)));
        storage.rows = kept;
        if removed.is_empty() {
            return Ok(0);
        }

        let references: Vec<(String, NamedConstraint)> = self
            .schema
            .referencing(table)
            .into_iter()
            .map(|(owner, fk)| (owner.name.clone(), fk.clone()))
            .collect();

        for (owner, fk) in references {
            let ConstraintSchema::ForeignKey { column, ref_column, on_delete, .. } = &fk.constraint else {
                continue;
            };
            let keys: Vec<Value> = removed
                .iter()
                .filter_map(|row| row.get(ref_column))
                .filter(|v| !v.is_null())
                .cloned()
                .collect();
            if keys.is_empty() {
                continue;
            }
            let dependents = Predicate::any_of(column.clone(), keys);
            if !self.rows_of(&owner).iter().any(|row| dependents.matches(row)) {
                continue;
            }
            match on_delete {
                OnDelete::Restrict => {
                    return Err(OrmError::constraint(
                        ConstraintKind::ForeignKey,
                        owner.clone(),
                        format!(
                            "delete on \"{}\" violates foreign key constraint \"{}\" on \"{}\"",
                            table, fk.name, owner
                        ),
                    ))
                }
                OnDelete::Cascade => {
                    let cascaded = self.delete_where(&owner, Some(&dependents))?;
                    debug!("Cascaded delete from {} to {} rows of {}", table, cascaded, owner);
                }
            }
        }

        Ok(removed.len() as u64)
    }

    fn apply_schema(&mut self, operation: &Operation) -> OrmResult<QueryResult> {
        self.schema.apply(operation).map_err(|e| match e {
            OrmError::MigrationConflict(reason) => OrmError::Database(reason),
            other => other,
        })?;

        match operation {
            Operation::CreateTable { table } => {
                self.tables.insert(table.name.clone(), MemoryTable::new());
            }
            Operation::DropTable { table } => {
                self.tables.remove(&table.name);
            }
            Operation::AddColumn { table, column } => {
                let default = match &column.db_default {
                    Some(expression) => eval_default(expression, column.field_type)?,
                    None => Value::Null,
                };
                let storage = self.tables.entry(table.clone()).or_insert_with(MemoryTable::new);
                if default.is_null() && !column.nullable && !storage.rows.is_empty() {
                    return Err(OrmError::constraint(
                        ConstraintKind::NotNull,
                        table.clone(),
                        format!("column \"{}\" contains null values", column.name),
                    ));
                }
                for row in &mut storage.rows {
                    row.insert(column.name.clone(), default.clone());
                }
            }
            Operation::DropColumn { table, column } => {
                if let Some(storage) = self.tables.get_mut(table) {
                    for row in &mut storage.rows {
                        row.shift_remove(&column.name);
                    }
                }
            }
            Operation::AddConstraint { table, .. } => {
                let schema = self.schema_of(table)?.clone();
                for (index, row) in self.rows_of(table).iter().enumerate() {
                    self.check_row(&schema, row, Some(index))?;
                }
            }
            Operation::DropConstraint { .. } => {}
        }
        Ok(QueryResult::default())
    }

    /// Not-null, primary key, unique and foreign key checks for a candidate
    /// row. `skip` is the index of the row being replaced, if any.
    fn check_row(&self, schema: &TableSchema, row: &Row, skip: Option<usize>) -> OrmResult<()> {
        let null = Value::Null;
        let value_of = |column: &str| row.get(column).unwrap_or(&null);
        let others = || {
            self.rows_of(&schema.name)
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, r)| r)
        };

        for column in &schema.columns {
            if !column.nullable && value_of(&column.name).is_null() {
                return Err(OrmError::constraint(
                    ConstraintKind::NotNull,
                    schema.name.clone(),
                    format!("null value in column \"{}\"", column.name),
                ));
            }
        }

        if let Some(pk) = schema.primary_key() {
            let key = value_of(&pk.name);
            if others().any(|r| r.get(&pk.name).is_some_and(|v| v.sql_eq(key))) {
                return Err(OrmError::constraint(
                    ConstraintKind::PrimaryKey,
                    schema.name.clone(),
                    format!("key ({})=({}) already exists", pk.name, key),
                ));
            }
        }

        for constraint in &schema.constraints {
            match &constraint.constraint {
                ConstraintSchema::Unique { columns } => {
                    let values: Vec<&Value> = columns.iter().map(|c| value_of(c)).collect();
                    if values.iter().any(|v| v.is_null()) {
                        continue;
                    }
                    let duplicate = others().any(|r| {
                        columns
                            .iter()
                            .zip(&values)
                            .all(|(c, v)| r.get(c).is_some_and(|existing| existing.sql_eq(v)))
                    });
                    if duplicate {
                        let kind = if columns.len() > 1 {
                            ConstraintKind::UniqueTogether
                        } else {
                            ConstraintKind::Unique
                        };
                        let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                        return Err(OrmError::constraint(
                            kind,
                            schema.name.clone(),
                            format!(
                                "{}: key ({})=({}) already exists",
                                constraint.name,
                                columns.join(", "),
                                rendered.join(", ")
                            ),
                        ));
                    }
                }
                ConstraintSchema::ForeignKey { column, ref_table, ref_column, .. } => {
                    let value = value_of(column);
                    if value.is_null() {
                        continue;
                    }
                    let present = if ref_table == &schema.name {
                        row.get(ref_column).is_some_and(|v| v.sql_eq(value))
                            || others().any(|r| r.get(ref_column).is_some_and(|v| v.sql_eq(value)))
                    } else {
                        self.rows_of(ref_table)
                            .iter()
                            .any(|r| r.get(ref_column).is_some_and(|v| v.sql_eq(value)))
                    };
                    if !present {
                        return Err(OrmError::constraint(
                            ConstraintKind::ForeignKey,
                            schema.name.clone(),
                            format!(
                                "{}: key ({})=({}) is not present in table \"{}\"",
                                constraint.name, column, value, ref_table
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Changing a referenced key must not orphan dependents
    fn check_referenced_keys(&self, schema: &TableSchema, old: &Row, new: &Row) -> OrmResult<()> {
        for (owner, fk) in self.schema.referencing(&schema.name) {
            let ConstraintSchema::ForeignKey { column, ref_column, .. } = &fk.constraint else {
                continue;
            };
            let (Some(before), Some(after)) = (old.get(ref_column), new.get(ref_column)) else {
                continue;
            };
            if before.is_null() || before.sql_eq(after) {
                continue;
            }
            let orphaned = self
                .rows_of(&owner.name)
                .iter()
                .any(|r| r.get(column).is_some_and(|v| v.sql_eq(before)));
            if orphaned {
                return Err(OrmError::constraint(
                    ConstraintKind::ForeignKey,
                    owner.name.clone(),
                    format!("{}: key ({})=({}) is still referenced", fk.name, ref_column, before),
                ));
            }
        }
        Ok(())
    }
}

/// Stable multi-key ordering; nulls sort last ascending and first descending
fn order_rows(a: &Row, b: &Row, terms: &[OrderTerm]) -> Ordering {
    for term in terms {
        let x = a.get(&term.column).unwrap_or(&Value::Null);
        let y = b.get(&term.column).unwrap_or(&Value::Null);
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => x.compare(y).unwrap_or(Ordering::Equal),
        };
        let ordering = if term.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn typed(table: &str, column: &ColumnSchema, value: Value) -> OrmResult<Value> {
    if !column.field_type.accepts(&value) {
        return Err(OrmError::Database(format!(
            "column \"{}\" of relation \"{}\" is of type {:?} but value is {}",
            column.name,
            table,
            column.field_type,
            value.type_name()
        )));
    }
    Ok(column.field_type.normalize(value))
}

/// Evaluate a storage-level default expression
fn eval_default(expression: &str, field_type: FieldType) -> OrmResult<Value> {
    let trimmed = expression.trim();
    let upper = trimmed.to_ascii_uppercase();
    let now = Utc::now();

    let value = match upper.as_str() {
        "CURRENT_TIMESTAMP" | "NOW()" if field_type == FieldType::Date => Value::Date(now.date_naive()),
        "CURRENT_TIMESTAMP" | "NOW()" => Value::Timestamp(now),
        "CURRENT_DATE" => Value::Date(now.date_naive()),
        "NULL" => Value::Null,
        "TRUE" => Value::Bool(true),
        "FALSE" => Value::Bool(false),
        _ if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') => {
            let text = trimmed[1..trimmed.len() - 1].replace("''", "'");
            field_type.coerce(JsonValue::String(text))?
        }
        _ if field_type.is_integer() => trimmed.parse::<i64>().map(Value::Int).map_err(|_| {
            OrmError::Database(format!("unsupported default expression '{}'", expression))
        })?,
        _ if field_type == FieldType::Float => {
            trimmed.parse::<f64>().map(Value::Float).map_err(|_| {
                OrmError::Database(format!("unsupported default expression '{}'", expression))
            })?
        }
        _ => {
            warn!("Unsupported default expression '{}' for {:?}", expression, field_type);
            return Err(OrmError::Database(format!(
                "unsupported default expression '{}'",
                expression
            )));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::SelectColumn;
    use crate::migrations::ColumnSchema;
    use crate::query::lookup::Lookup;

    fn users() -> TableSchema {
        let mut users = TableSchema::new("users")
            .column({
                let mut id = ColumnSchema::new("id", FieldType::BigInteger).primary_key();
                id.auto_increment = true;
                id
            })
            .column(ColumnSchema::new("username", FieldType::Text))
            .column({
                let mut created = ColumnSchema::new("created_at", FieldType::Timestamp).nullable();
                created.db_default = Some("CURRENT_TIMESTAMP".into());
                created
            });
        users
            .constraints
            .push(NamedConstraint::unique("users", vec!["username".into()]));
        users
    }

    fn posts(on_delete: OnDelete) -> TableSchema {
        let mut posts = TableSchema::new("posts")
            .column({
                let mut id = ColumnSchema::new("id", FieldType::BigInteger).primary_key();
                id.auto_increment = true;
                id
            })
            .column(ColumnSchema::new("author_id", FieldType::BigInteger).nullable());
        posts.constraints.push(NamedConstraint::foreign_key(
            "posts", "author_id", "users", "id", on_delete,
        ));
        posts
    }

    async fn connection(on_delete: OnDelete) -> Box<dyn DatabaseConnection> {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        conn.execute(&Statement::Schema(Operation::CreateTable { table: users() }))
            .await
            .unwrap();
        conn.execute(&Statement::Schema(Operation::CreateTable { table: posts(on_delete) }))
            .await
            .unwrap();
        conn
    }

    fn insert(table: &str, values: &[(&str, Value)]) -> Statement {
        Statement::Insert(InsertStatement {
            table: table.into(),
            values: values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            returning: Vec::new(),
        })
    }

    fn count(table: &str) -> Statement {
        let mut select = SelectStatement::new(table, vec![SelectColumn::new("id", FieldType::BigInteger)]);
        select.projection = Projection::Count;
        Statement::Select(select)
    }

    async fn count_rows(conn: &mut Box<dyn DatabaseConnection>, table: &str) -> i64 {
        let result = conn.execute(&count(table)).await.unwrap();
        result.rows[0]["count"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_insert_fills_server_defaults() {
        let mut conn = connection(OnDelete::Cascade).await;
        let result = conn
            .execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap();
        let row = &result.rows[0];
        assert_eq!(row["id"], Value::Int(1));
        assert!(matches!(row["created_at"], Value::Timestamp(_)));

        let result = conn
            .execute(&insert("users", &[("username", "bob".into())]))
            .await
            .unwrap();
        assert_eq!(result.rows[0]["id"], Value::Int(2));
    }

    #[tokio::test]
    async fn test_unique_and_foreign_key_violations() {
        let mut conn = connection(OnDelete::Cascade).await;
        conn.execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap();

        let err = conn
            .execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrmError::ConstraintViolation { kind: ConstraintKind::Unique, .. }
        ));

        let err = conn
            .execute(&insert("posts", &[("author_id", Value::Int(99))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrmError::ConstraintViolation { kind: ConstraintKind::ForeignKey, .. }
        ));
        assert_eq!(count_rows(&mut conn, "posts").await, 0);
    }

    #[tokio::test]
    async fn test_cascade_and_restrict() {
        let mut conn = connection(OnDelete::Cascade).await;
        conn.execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap();
        conn.execute(&insert("posts", &[("author_id", Value::Int(1))]))
            .await
            .unwrap();
        let delete = Statement::Delete(DeleteStatement {
            table: "users".into(),
            predicate: Some(Predicate::compare("id", Lookup::Exact, 1)),
        });
        let result = conn.execute(&delete).await.unwrap();
        assert_eq!(result.affected, 1);
        assert_eq!(count_rows(&mut conn, "posts").await, 0);

        let mut conn = connection(OnDelete::Restrict).await;
        conn.execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap();
        conn.execute(&insert("posts", &[("author_id", Value::Int(1))]))
            .await
            .unwrap();
        let err = conn.execute(&delete).await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(count_rows(&mut conn, "users").await, 1);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_restores_state() {
        let mut conn = connection(OnDelete::Cascade).await;
        conn.begin(&TransactionConfig::default()).await.unwrap();
        conn.execute(&insert("users", &[("username", "ada".into())]))
            .await
            .unwrap();
        conn.savepoint("sp_1_1").await.unwrap();
        conn.execute(&insert("users", &[("username", "bob".into())]))
            .await
            .unwrap();
        conn.rollback_to_savepoint("sp_1_1").await.unwrap();
        assert_eq!(count_rows(&mut conn, "users").await, 1);
        conn.rollback().await.unwrap();
        assert_eq!(count_rows(&mut conn, "users").await, 0);
    }

    #[tokio::test]
    async fn test_advisory_lock_is_exclusive_across_connections() {
        let backend = MemoryBackend::new();
        let mut a = backend.connect().await.unwrap();
        let mut b = backend.connect().await.unwrap();
        assert!(a.try_advisory_lock(7).await.unwrap());
        assert!(!b.try_advisory_lock(7).await.unwrap());
        drop(a);
        assert!(b.try_advisory_lock(7).await.unwrap());
    }

    #[test]
    fn test_eval_default_literals() {
        assert_eq!(eval_default("FALSE", FieldType::Boolean).unwrap(), Value::Bool(false));
        assert_eq!(eval_default("42", FieldType::Integer).unwrap(), Value::Int(42));
        assert_eq!(
            eval_default("'it''s'", FieldType::Text).unwrap(),
            Value::Text("it's".into())
        );
        assert!(eval_default("gen_random_uuid()", FieldType::Text).is_err());
    }
}
