//! Typed entities
//!
//! A `Model` is any serde-serializable struct paired with its descriptor.
//! Entities cross into rows through `serde_json`, with each column decoded
//! by its declared `FieldType`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::query::QuerySet;
use crate::schema::{ModelDescriptor, ResolvedModel, SchemaRegistry};
use crate::value::{row_to_json, Row};

/// A persisted entity type
pub trait Model: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    /// Model name as registered in the schema registry
    const NAME: &'static str;

    /// Structural declaration of this model
    fn descriptor() -> ModelDescriptor;

    /// Query set over every row of this model
    fn objects(registry: &Arc<SchemaRegistry>) -> OrmResult<QuerySet<Self>> {
        QuerySet::new(registry)
    }
}

/// Serialize an entity into a row with one entry per declared field present
/// on the entity
pub fn to_row<M: Model>(entity: &M, model: &ResolvedModel) -> OrmResult<Row> {
    let json = serde_json::to_value(entity)?;
    let JsonValue::Object(mut object) = json else {
        return Err(OrmError::Serialization(format!(
            "model '{}' must serialize to a JSON object",
            M::NAME
        )));
    };

    let mut row = Row::new();
    for field in model.fields() {
        if let Some(raw) = object.remove(&field.name) {
            row.insert(field.name.clone(), field.field_type.coerce(raw)?);
        }
    }
    Ok(row)
}

/// Deserialize an entity from a stored row
pub fn from_row<M: Model>(row: &Row) -> OrmResult<M> {
    serde_json::from_value(row_to_json(row)).map_err(|e| {
        OrmError::Serialization(format!("failed to decode '{}' row: {}", M::NAME, e))
    })
}
