//! PostgreSQL Backend Implementation
//!
//! Statements are rendered by `crate::sql` and executed through a sqlx pool.
//! Rows travel back as `row_to_json` text and are decoded column by column
//! with the declared field types.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgConnection, Postgres, Row as SqlxRow};
use tracing::{debug, warn};

use super::core::{
    DatabaseBackend, DatabaseConnection, Projection, QueryResult, SelectColumn, Statement,
};
use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::sql::render::{render_delete, render_insert, render_select, render_update};
use crate::sql::{quote_ident, render_operation};
use crate::transaction::TransactionConfig;
use crate::value::{Row, Value};

/// PostgreSQL backend over a sqlx pool
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Create a lazily-connecting pool; connections open on first acquire
    pub fn create_pool(config: &DatabaseConfig) -> OrmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_lazy(&config.url)
            .map_err(|e| OrmError::Connection(format!("Failed to create PostgreSQL pool: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresConnection {
            conn: Some(conn),
            in_transaction: false,
        }))
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
}

impl PostgresConnection {
    fn raw(&mut self) -> OrmResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .map(|c| &mut **c)
            .ok_or_else(|| OrmError::Connection("connection was discarded".to_string()))
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        debug!("SQL: {}", sql);
        let query = bind_all(sqlx::query(sql), params)?;
        let result = query.execute(self.raw()?).await?;
        Ok(result.rows_affected())
    }

    /// COMMIT or ROLLBACK; a connection where it fails is closed
    async fn finish(&mut self, sql: &str) -> OrmResult<()> {
        match self.run(sql, &[]).await {
            Ok(_) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                warn!("{} failed: {}", sql, e);
                self.discard_transaction();
                Err(e)
            }
        }
    }

    async fn configure(&mut self, config: &TransactionConfig) -> OrmResult<()> {
        if let Some(level) = config.isolation_level {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            self.run(&sql, &[]).await?;
        }
        if config.read_only {
            self.run("SET TRANSACTION READ ONLY", &[]).await?;
        }
        Ok(())
    }

    /// Rows of a query whose single column is a JSON document
    async fn fetch_json(&mut self, sql: &str, params: &[Value]) -> OrmResult<Vec<JsonValue>> {
        debug!("SQL: {}", sql);
        let query = bind_all(sqlx::query(sql), params)?;
        let rows = query.fetch_all(self.raw()?).await?;
        rows.iter()
            .map(|row| {
                let text: String = row.try_get(0)?;
                Ok(serde_json::from_str(&text)?)
            })
            .collect()
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<QueryResult> {
        match statement {
            Statement::Select(select) if select.projection == Projection::Count => {
                let rendered = render_select(select);
                debug!("SQL: {}", rendered.sql);
                let query = bind_all(sqlx::query(&rendered.sql), &rendered.params)?;
                let row = query.fetch_one(self.raw()?).await?;
                let count: i64 = row.try_get("count")?;
                let mut out = Row::new();
                out.insert("count".to_string(), Value::Int(count));
                Ok(QueryResult::rows(vec![out]))
            }
            Statement::Select(select) => {
                let rendered = render_select(select);
                let sql = format!("SELECT row_to_json(q)::text FROM ({}) AS q", rendered.sql);
                let mut columns: Vec<(String, &SelectColumn)> =
                    select.columns.iter().map(|c| (c.name.clone(), c)).collect();
                for join in &select.joins {
                    columns.extend(join.columns.iter().map(|c| (join.key(&c.name), c)));
                }
                let documents = self.fetch_json(&sql, &rendered.params).await?;
                let rows = documents
                    .into_iter()
                    .map(|doc| decode_row(doc, &columns))
                    .collect::<OrmResult<Vec<_>>>()?;
                Ok(QueryResult::rows(rows))
            }
            Statement::Insert(insert) => {
                let rendered = render_insert(insert);
                let sql = format!(
                    "WITH ins AS ({}) SELECT row_to_json(ins)::text FROM ins",
                    rendered.sql
                );
                let columns: Vec<(String, &SelectColumn)> =
                    insert.returning.iter().map(|c| (c.name.clone(), c)).collect();
                let documents = self.fetch_json(&sql, &rendered.params).await?;
                let rows = documents
                    .into_iter()
                    .map(|doc| {
                        if columns.is_empty() {
                            decode_untyped(doc)
                        } else {
                            decode_row(doc, &columns)
                        }
                    })
                    .collect::<OrmResult<Vec<_>>>()?;
                Ok(QueryResult::rows(rows))
            }
            Statement::Update(update) => {
                let rendered = render_update(update);
                let affected = self.run(&rendered.sql, &rendered.params).await?;
                Ok(QueryResult::affected(affected))
            }
            Statement::Delete(delete) => {
                let rendered = render_delete(delete);
                let affected = self.run(&rendered.sql, &rendered.params).await?;
                Ok(QueryResult::affected(affected))
            }
            Statement::Schema(operation) => {
                for sql in render_operation(operation) {
                    self.run(&sql, &[]).await?;
                }
                Ok(QueryResult::default())
            }
        }
    }

    async fn begin(&mut self, config: &TransactionConfig) -> OrmResult<()> {
        if self.in_transaction {
            return Err(OrmError::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        self.run("BEGIN", &[]).await?;
        self.in_transaction = true;

        if let Err(e) = self.configure(config).await {
            warn!("Transaction settings rejected: {}", e);
            self.discard_transaction();
            return Err(e);
        }
        Ok(())
    }

    async fn commit(&mut self) -> OrmResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> OrmResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> OrmResult<()> {
        self.run(&format!("SAVEPOINT {}", quote_ident(name)), &[]).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> OrmResult<()> {
        self.run(&format!("RELEASE SAVEPOINT {}", quote_ident(name)), &[])
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> OrmResult<()> {
        let name = quote_ident(name);
        self.run(&format!("ROLLBACK TO SAVEPOINT {}", name), &[]).await?;
        self.run(&format!("RELEASE SAVEPOINT {}", name), &[]).await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> OrmResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(self.raw()?)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn try_advisory_lock(&mut self, key: i64) -> OrmResult<bool> {
        let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(self.raw()?)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn advisory_unlock(&mut self, key: i64) -> OrmResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(self.raw()?)
            .await?;
        Ok(())
    }

    fn discard_transaction(&mut self) {
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        // Closing the socket makes the server roll the transaction back
        if let Some(conn) = self.conn.take() {
            warn!("Closing PostgreSQL connection with an open transaction");
            drop(conn.detach());
        }
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        self.discard_transaction();
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> OrmResult<Query<'q, Postgres, PgArguments>> {
    for param in params {
        query = bind_value(query, param)?;
    }
    Ok(query)
}

/// Bind a Value to a sqlx query
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> OrmResult<Query<'q, Postgres, PgArguments>> {
    Ok(match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::Date(d) => query.bind(*d),
        Value::Uuid(u) => query.bind(*u),
        Value::Json(j) => query.bind(j.clone()),
        Value::List(_) => {
            return Err(OrmError::Query(
                "list values must be expanded before binding".to_string(),
            ))
        }
    })
}

fn decode_row(document: JsonValue, columns: &[(String, &SelectColumn)]) -> OrmResult<Row> {
    let JsonValue::Object(mut object) = document else {
        return Err(OrmError::Serialization(
            "expected a JSON object per row".to_string(),
        ));
    };
    let mut row = Row::new();
    for (key, column) in columns {
        let raw = object.remove(key).unwrap_or(JsonValue::Null);
        row.insert(key.clone(), column.field_type.coerce(raw)?);
    }
    Ok(row)
}

fn decode_untyped(document: JsonValue) -> OrmResult<Row> {
    match document {
        JsonValue::Object(object) => Ok(object
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect()),
        _ => Err(OrmError::Serialization(
            "expected a JSON object per row".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_commit_closes_transaction() {
        let mut conn = PostgresConnection {
            conn: None,
            in_transaction: true,
        };
        assert!(matches!(conn.commit().await, Err(OrmError::Connection(_))));
        assert!(!conn.in_transaction);

        // The next begin fails on the connection, not on a stale transaction
        let err = conn.begin(&TransactionConfig::default()).await.unwrap_err();
        assert!(matches!(err, OrmError::Connection(_)));
    }
}
