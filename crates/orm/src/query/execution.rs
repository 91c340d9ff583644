//! Query Builder execution for Model types

use tracing::debug;

use super::builder::QuerySet;
use super::condition::Q;
use crate::backends::{Projection, Statement};
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::relationships::loader::{prefetch, split_joined};
use crate::relationships::Instance;
use crate::transaction::Session;
use crate::value::Value;

impl<M: Model> QuerySet<M> {
    /// Number of matching rows; ordering, limit and offset do not apply
    pub async fn count(&self, session: &mut Session) -> OrmResult<u64> {
        let mut select = self.select_statement()?;
        select.joins.clear();
        select.projection = Projection::Count;
        let result = session.execute(&Statement::Select(select)).await?;
        let count = result
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .ok_or_else(|| OrmError::Database("count query returned no count".to_string()))?;
        Ok(count.max(0) as u64)
    }

    /// Whether any row matches, probing at most one row
    pub async fn exists(&self, session: &mut Session) -> OrmResult<bool> {
        let mut select = self.select_statement()?;
        select.joins.clear();
        select.limit = Some(self.limit.map_or(1, |l| l.min(1)));
        let result = session.execute(&Statement::Select(select)).await?;
        Ok(!result.rows.is_empty())
    }

    /// Materialize every matching row, with joins and prefetches loaded
    pub async fn all(&self, session: &mut Session) -> OrmResult<Vec<Instance<M>>> {
        let select = self.select_statement()?;
        let result = session.execute(&Statement::Select(select.clone())).await?;
        debug!("{} returned {} rows", self.model.name(), result.rows.len());

        let mut instances = result
            .rows
            .into_iter()
            .map(|row| split_joined::<M>(row, &self.model, &select.joins))
            .collect::<OrmResult<Vec<_>>>()?;

        for name in self.prefetches.iter() {
            prefetch(session, &self.registry, &self.model, name, &mut instances).await?;
        }
        Ok(instances)
    }

    /// First row in query order, or `None`
    pub async fn first(&self, session: &mut Session) -> OrmResult<Option<Instance<M>>> {
        let mut rows = self.limit_at_most(1).all(session).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    /// The single row matching `q`, `None` when nothing matches; more than
    /// one match is a query error
    pub async fn get_or_none(&self, session: &mut Session, q: Q) -> OrmResult<Option<Instance<M>>> {
        let mut rows = self.filter(q)?.limit_at_most(2).all(session).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            _ => Err(OrmError::Query(format!(
                "get_or_none on '{}' matched more than one row",
                self.model.name()
            ))),
        }
    }

    /// Row with primary key `pk`
    pub async fn get_by_pk(&self, session: &mut Session, pk: impl Into<Value>) -> OrmResult<Option<Instance<M>>> {
        let q = Q::eq(self.model.pk_column().to_string(), pk);
        self.get_or_none(session, q).await
    }
}
