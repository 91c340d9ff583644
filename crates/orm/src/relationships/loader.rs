//! Relationship loading
//!
//! Joined to-one rows are split out of the base row. Collections are loaded
//! after the parents with `IN (parent keys)` queries, chunked by
//! `BatchConfig::max_batch_size`, and merged in memory by parent key.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use super::instance::{Instance, Related};
use crate::backends::{JoinSpec, SelectColumn, SelectStatement, Statement};
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::query::builder::columns_of;
use crate::query::ordering::OrderTerm;
use crate::query::predicate::Predicate;
use crate::schema::{RelationshipPath, ResolvedModel, SchemaRegistry};
use crate::transaction::Session;
use crate::value::{KeyValue, Row, Value};

/// Prefetch batching options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Largest number of parent keys in one `IN` list
    pub max_batch_size: usize,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(500)
    }
}

/// Split a joined row into the base instance and its to-one relations
pub(crate) fn split_joined<M: Model>(
    mut row: Row,
    model: &ResolvedModel,
    joins: &[JoinSpec],
) -> OrmResult<Instance<M>> {
    let mut loaded = Vec::with_capacity(joins.len());
    for join in joins {
        let mut related = Row::new();
        for column in &join.columns {
            let value = row.shift_remove(&join.key(&column.name)).unwrap_or(Value::Null);
            related.insert(column.name.clone(), value);
        }
        let present = related
            .get(&join.target_column)
            .is_some_and(|key| !key.is_null());
        loaded.push((join.alias.as_str(), present.then_some(related)));
    }

    let mut instance = Instance::<M>::from_row(row)?;
    for (alias, related) in loaded {
        let target = model
            .relationship(alias)
            .map(|r| r.target_model.as_str())
            .unwrap_or_default();
        instance.set_related(alias, target, Related::One(related));
    }
    Ok(instance)
}

/// Distinct non-null keys in first-seen order
fn distinct_keys<'a>(values: impl Iterator<Item = &'a Value>) -> IndexMap<KeyValue, Value> {
    let mut keys = IndexMap::new();
    for value in values {
        if let Some(key) = value.key() {
            keys.entry(key).or_insert_with(|| value.clone());
        }
    }
    keys
}

async fn fetch_in_batches(
    session: &mut Session,
    table: &str,
    columns: &[SelectColumn],
    key_column: &str,
    keys: &[Value],
    order_column: &str,
) -> OrmResult<Vec<Row>> {
    let batch = session.batch_config().max_batch_size;
    let mut rows = Vec::new();
    for chunk in keys.chunks(batch) {
        let select = SelectStatement::new(table, columns.to_vec())
            .filter(Predicate::any_of(key_column, chunk.to_vec()))
            .order(vec![OrderTerm::asc(order_column)]);
        rows.extend(session.execute(&Statement::Select(select)).await?.rows);
    }
    Ok(rows)
}

fn key_of(row: &Row, column: &str) -> Option<KeyValue> {
    row.get(column).and_then(Value::key)
}

/// Load collection `name` for every parent
pub(crate) async fn prefetch<M>(
    session: &mut Session,
    registry: &SchemaRegistry,
    model: &ResolvedModel,
    name: &str,
    parents: &mut [Instance<M>],
) -> OrmResult<()> {
    let relationship = model.relationship(name).ok_or_else(|| {
        OrmError::Query(format!(
            "model '{}' has no relationship '{}'",
            model.name(),
            name
        ))
    })?;
    let target = registry.get(&relationship.target_model)?;

    let mut groups: HashMap<KeyValue, Vec<Row>> = HashMap::new();
    let local_column = match &relationship.path {
        RelationshipPath::ToOne { .. } => {
            return Err(OrmError::Relationship(format!(
                "cannot prefetch to-one relationship '{}.{}'",
                model.name(),
                name
            )));
        }
        RelationshipPath::Reverse {
            local_column,
            target_column,
        } => {
            let keys = distinct_keys(parents.iter().filter_map(|p| p.get(local_column)));
            let keys: Vec<Value> = keys.into_values().collect();
            let rows = fetch_in_batches(
                session,
                target.table(),
                &columns_of(&target),
                target_column,
                &keys,
                target.pk_column(),
            )
            .await?;
            debug!("Prefetched {} rows for {}.{}", rows.len(), model.name(), name);
            for row in rows {
                if let Some(key) = key_of(&row, target_column) {
                    groups.entry(key).or_default().push(row);
                }
            }
            local_column
        }
        RelationshipPath::Through {
            junction_table,
            junction_key,
            source_column,
            target_column,
            local_column,
            target_key,
        } => {
            let junction = registry.get_by_table(junction_table)?;
            let junction_columns = columns_of(&junction)
                .into_iter()
                .filter(|c| c.name == *junction_key || c.name == *source_column || c.name == *target_column)
                .collect::<Vec<_>>();

            let keys = distinct_keys(parents.iter().filter_map(|p| p.get(local_column)));
            let keys: Vec<Value> = keys.into_values().collect();
            let links = fetch_in_batches(
                session,
                junction_table,
                &junction_columns,
                source_column,
                &keys,
                junction_key,
            )
            .await?;

            let target_ids: Vec<Value> = distinct_keys(links.iter().filter_map(|l| l.get(target_column)))
                .into_values()
                .collect();
            let targets = fetch_in_batches(
                session,
                target.table(),
                &columns_of(&target),
                target_key,
                &target_ids,
                target_key,
            )
            .await?;
            debug!(
                "Prefetched {} rows through {} links for {}.{}",
                targets.len(),
                links.len(),
                model.name(),
                name
            );

            let by_key: HashMap<KeyValue, Row> = targets
                .into_iter()
                .filter_map(|row| key_of(&row, target_key).map(|k| (k, row)))
                .collect();
            // Junction rows arrive ordered by junction key
            for link in &links {
                let (Some(source), Some(target_id)) =
                    (key_of(link, source_column), key_of(link, target_column))
                else {
                    continue;
                };
                if let Some(row) = by_key.get(&target_id) {
                    groups.entry(source).or_default().push(row.clone());
                }
            }
            local_column
        }
    };

    for parent in parents.iter_mut() {
        let rows = key_of(parent.row(), local_column)
            .and_then(|key| groups.get(&key).cloned())
            .unwrap_or_default();
        parent.set_related(name, &relationship.target_model, Related::Many(rows));
    }
    Ok(())
}
