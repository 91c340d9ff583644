//! Query Builder writes: create, save, update, delete

use tracing::debug;

use super::builder::{columns_of, QuerySet};
use super::changes::Changes;
use super::lookup::Lookup;
use super::predicate::Predicate;
use crate::backends::{DeleteStatement, InsertStatement, Statement, UpdateStatement};
use crate::error::{OrmError, OrmResult};
use crate::model::{from_row, to_row, Model};
use crate::transaction::Session;
use crate::value::{Row, Value};

impl<M: Model> QuerySet<M> {
    /// Insert a row from `changes`; omitted fields take their declared
    /// defaults. Returns the stored entity, server-assigned values included.
    pub async fn create(&self, session: &mut Session, changes: Changes) -> OrmResult<M> {
        let values = changes.validate(&self.model, true)?;
        self.insert_row(session, values).await
    }

    /// Insert an entity; an unset primary key is assigned by the store
    pub async fn create_entity(&self, session: &mut Session, entity: &M) -> OrmResult<M> {
        let values = to_row(entity, &self.model)?;
        self.insert_row(session, values).await
    }

    /// Insert when the primary key is unset, update otherwise. An update
    /// that matches no row inserts with the given key.
    pub async fn save(&self, session: &mut Session, entity: &mut M) -> OrmResult<()> {
        let row = to_row(entity, &self.model)?;
        let pk = self.model.pk_column().to_string();
        let pk_value = row.get(&pk).cloned().unwrap_or(Value::Null);
        if pk_value.is_null() {
            *entity = self.insert_row(session, row).await?;
            return Ok(());
        }

        let by_pk = Predicate::compare(pk.clone(), Lookup::Exact, pk_value.clone());
        let mut values = row.clone();
        values.shift_remove(&pk);

        let found = if values.is_empty() {
            self.base().with_predicate(by_pk).exists(session).await?
        } else {
            let update = UpdateStatement {
                table: self.model.table().to_string(),
                values,
                predicate: Some(by_pk),
            };
            session.execute(&Statement::Update(update)).await?.affected > 0
        };

        if found {
            debug!("Updated {} {}", self.model.name(), pk_value);
        } else {
            *entity = self.insert_row(session, row).await?;
        }
        Ok(())
    }

    /// Apply `changes` to every matching row; returns the number of rows updated
    pub async fn update(&self, session: &mut Session, changes: Changes) -> OrmResult<u64> {
        self.ensure_unsliced("update")?;
        let values = changes.validate(&self.model, false)?;
        if values.is_empty() {
            return self.count(session).await;
        }
        let update = UpdateStatement {
            table: self.model.table().to_string(),
            values,
            predicate: self.predicate.as_deref().cloned(),
        };
        let affected = session.execute(&Statement::Update(update)).await?.affected;
        debug!("Updated {} {} rows", affected, self.model.name());
        Ok(affected)
    }

    /// Delete every matching row; dependents follow their on-delete rule.
    /// Returns the number of rows of this model deleted.
    pub async fn delete(&self, session: &mut Session) -> OrmResult<u64> {
        self.ensure_unsliced("delete")?;
        let delete = DeleteStatement {
            table: self.model.table().to_string(),
            predicate: self.predicate.as_deref().cloned(),
        };
        let affected = session.execute(&Statement::Delete(delete)).await?.affected;
        debug!("Deleted {} {} rows", affected, self.model.name());
        Ok(affected)
    }

    /// Delete one persisted entity; `false` when it was already gone
    pub async fn delete_entity(&self, session: &mut Session, entity: &M) -> OrmResult<bool> {
        let row = to_row(entity, &self.model)?;
        let pk = self.model.pk_column();
        let pk_value = row.get(pk).cloned().unwrap_or(Value::Null);
        if pk_value.is_null() {
            return Err(OrmError::Validation(format!(
                "cannot delete an unsaved '{}'",
                self.model.name()
            )));
        }
        let deleted = self
            .base()
            .with_predicate(Predicate::compare(pk, Lookup::Exact, pk_value))
            .delete(session)
            .await?;
        Ok(deleted > 0)
    }

    async fn insert_row(&self, session: &mut Session, mut values: Row) -> OrmResult<M> {
        for field in self.model.fields() {
            let missing = values.get(&field.name).map_or(true, Value::is_null);
            if !missing {
                continue;
            }
            if let Some(default) = &field.default {
                values.insert(field.name.clone(), default.clone());
            } else if field.has_server_default() {
                values.shift_remove(&field.name);
            }
        }

        let insert = InsertStatement {
            table: self.model.table().to_string(),
            values,
            returning: columns_of(&self.model),
        };
        let result = session.execute(&Statement::Insert(insert)).await?;
        let row = result.rows.into_iter().next().ok_or_else(|| {
            OrmError::Database(format!("insert into '{}' returned no row", self.model.table()))
        })?;
        debug!(
            "Created {} {}",
            self.model.name(),
            row.get(self.model.pk_column()).unwrap_or(&crate::value::Value::Null)
        );
        from_row::<M>(&row)
    }

    /// Same model, no filters
    fn base(&self) -> Self {
        let mut base = self.clone();
        base.predicate = None;
        base.joins = Vec::new().into();
        base.prefetches = Vec::new().into();
        base.limit = None;
        base.offset = None;
        base
    }

    fn ensure_unsliced(&self, action: &str) -> OrmResult<()> {
        if self.limit.is_some() || self.offset.is_some() {
            return Err(OrmError::Query(format!(
                "cannot {} a sliced query on '{}'",
                action,
                self.model.name()
            )));
        }
        Ok(())
    }
}
