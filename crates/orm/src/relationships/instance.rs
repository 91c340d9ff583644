//! Materialized entities with their loaded relationships

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::ser::{Error as _, SerializeMap};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::model::{from_row, Model};
use crate::value::{row_to_json, Row, Value};

/// Rows loaded for one relationship
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// To-one; `None` when the foreign key is unset or dangling
    One(Option<Row>),
    /// Collection, in load order; empty when nothing matches
    Many(Vec<Row>),
}

#[derive(Debug, Clone, PartialEq)]
struct LoadedRelation {
    target_model: String,
    related: Related,
}

/// An entity plus the row it was read from and any loaded relationships.
///
/// Derefs to the entity.
#[derive(Clone)]
pub struct Instance<M> {
    entity: M,
    row: Row,
    relations: BTreeMap<String, LoadedRelation>,
}

impl<M: Model> Instance<M> {
    pub(crate) fn from_row(row: Row) -> OrmResult<Self> {
        Ok(Self {
            entity: from_row::<M>(&row)?,
            row,
            relations: BTreeMap::new(),
        })
    }
}

impl<M> Instance<M> {
    pub fn entity(&self) -> &M {
        &self.entity
    }

    pub fn into_inner(self) -> M {
        self.entity
    }

    /// Stored row, as read
    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub(crate) fn set_related(&mut self, name: &str, target_model: &str, related: Related) {
        self.relations.insert(
            name.to_string(),
            LoadedRelation {
                target_model: target_model.to_string(),
                related,
            },
        );
    }

    fn loaded<T: Model>(&self, name: &str) -> OrmResult<&Related> {
        let relation = self.relations.get(name).ok_or_else(|| {
            OrmError::Relationship(format!(
                "relationship '{}' was not loaded; use join or prefetch",
                name
            ))
        })?;
        if relation.target_model != T::NAME {
            return Err(OrmError::Relationship(format!(
                "relationship '{}' targets '{}', not '{}'",
                name,
                relation.target_model,
                T::NAME
            )));
        }
        Ok(&relation.related)
    }

    /// Joined to-one relationship
    pub fn related_one<T: Model>(&self, name: &str) -> OrmResult<Option<T>> {
        match self.loaded::<T>(name)? {
            Related::One(row) => row.as_ref().map(from_row::<T>).transpose(),
            Related::Many(_) => Err(OrmError::Relationship(format!(
                "relationship '{}' is a collection",
                name
            ))),
        }
    }

    /// Prefetched collection
    pub fn related_many<T: Model>(&self, name: &str) -> OrmResult<Vec<T>> {
        match self.loaded::<T>(name)? {
            Related::Many(rows) => rows.iter().map(from_row::<T>).collect(),
            Related::One(_) => Err(OrmError::Relationship(format!(
                "relationship '{}' is to-one",
                name
            ))),
        }
    }
}

impl<M> Deref for Instance<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.entity
    }
}

impl<M> DerefMut for Instance<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.entity
    }
}

impl<M: fmt::Debug> fmt::Debug for Instance<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("entity", &self.entity)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Serializes as the entity's own fields with each loaded relationship
/// embedded under its name
impl<M: Serialize> Serialize for Instance<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let JsonValue::Object(fields) = serde_json::to_value(&self.entity).map_err(S::Error::custom)?
        else {
            return Err(S::Error::custom("entity must serialize to an object"));
        };

        let mut map = serializer.serialize_map(Some(fields.len() + self.relations.len()))?;
        for (key, value) in &fields {
            map.serialize_entry(key, value)?;
        }
        for (name, relation) in &self.relations {
            match &relation.related {
                Related::One(Some(row)) => map.serialize_entry(name, &row_to_json(row))?,
                Related::One(None) => map.serialize_entry(name, &JsonValue::Null)?,
                Related::Many(rows) => {
                    let items: Vec<JsonValue> = rows.iter().map(row_to_json).collect();
                    map.serialize_entry(name, &items)?
                }
            }
        }
        map.end()
    }
}
