//! Partial field changes for create and update

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::model::{to_row, Model};
use crate::schema::{FieldDescriptor, FieldType, ResolvedModel};
use crate::value::{Row, Value};

/// Field name to value mapping, validated against a model before use.
///
/// Names may be fields or to-one relationship names (`author` sets
/// `author_id`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    values: IndexMap<String, Value>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Changes from a JSON object, e.g. a request body
    pub fn from_json(json: JsonValue) -> OrmResult<Self> {
        match json {
            JsonValue::Object(object) => Ok(Self {
                values: object
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            }),
            other => Err(OrmError::Validation(format!(
                "expected a JSON object of changes, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Column-keyed row. Unknown names and ill-typed values are rejected;
    /// so is the primary key unless `allow_pk`.
    pub fn validate(&self, model: &ResolvedModel, allow_pk: bool) -> OrmResult<Row> {
        let mut row = Row::new();
        for (name, value) in &self.values {
            let field = model.resolve_field(name).ok_or_else(|| {
                OrmError::Validation(format!("unknown field '{}' on model '{}'", name, model.name()))
            })?;
            if field.primary_key && !allow_pk {
                return Err(OrmError::Validation(format!(
                    "cannot change primary key '{}' of model '{}'",
                    field.name,
                    model.name()
                )));
            }
            row.insert(field.name.clone(), coerce_input(model, field, value.clone())?);
        }
        Ok(row)
    }

    /// Apply onto an entity in place. The primary key of a persisted
    /// entity may only be "changed" to its current value.
    pub fn apply_to<M: Model>(&self, entity: &mut M, model: &ResolvedModel) -> OrmResult<()> {
        let changes = self.validate(model, true)?;
        let current = to_row(entity, model)?;

        let pk = model.pk_column();
        if let (Some(new), Some(old)) = (changes.get(pk), current.get(pk)) {
            if !old.is_null() && new != old {
                return Err(OrmError::Validation(format!(
                    "cannot change primary key '{}' of a persisted '{}'",
                    pk,
                    model.name()
                )));
            }
        }

        let mut json = serde_json::to_value(&*entity)?;
        let JsonValue::Object(object) = &mut json else {
            return Err(OrmError::Serialization(format!(
                "model '{}' must serialize to a JSON object",
                M::NAME
            )));
        };
        for (column, value) in &changes {
            object.insert(column.clone(), value.to_json());
        }
        *entity = serde_json::from_value(json)
            .map_err(|e| OrmError::Validation(format!("invalid changes for '{}': {}", M::NAME, e)))?;
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Changes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Check a caller-supplied value against a field, parsing text for
/// temporal and uuid columns
pub(crate) fn coerce_input(model: &ResolvedModel, field: &FieldDescriptor, value: Value) -> OrmResult<Value> {
    let value = match (&value, field.field_type) {
        (Value::Text(text), FieldType::Timestamp | FieldType::Date | FieldType::Uuid) => field
            .field_type
            .coerce(JsonValue::String(text.clone()))
            .map_err(|_| {
                OrmError::Validation(format!(
                    "{}.{}: cannot parse '{}' as {:?}",
                    model.name(),
                    field.name,
                    text,
                    field.field_type
                ))
            })?,
        _ => value,
    };
    if !field.field_type.accepts(&value) {
        return Err(OrmError::Validation(format!(
            "{}.{} expects {:?}, got {}",
            model.name(),
            field.name,
            field.field_type,
            value.type_name()
        )));
    }
    Ok(field.field_type.normalize(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, ModelDescriptor, OnDelete, SchemaRegistry};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: Option<i64>,
        title: String,
        author_id: Option<i64>,
    }

    impl Model for Post {
        const NAME: &'static str = "Post";

        fn descriptor() -> ModelDescriptor {
            ModelDescriptor::new("Post", "posts")
                .field(FieldDescriptor::id())
                .field(FieldDescriptor::text("title"))
                .field(FieldDescriptor::timestamp("published_at").nullable())
                .foreign_key("author", "User", OnDelete::Cascade)
        }
    }

    fn post_model() -> Arc<ResolvedModel> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(ModelDescriptor::new("User", "users").field(FieldDescriptor::id()))
            .unwrap();
        registry.register_model::<Post>().unwrap();
        registry.finalize().unwrap();
        registry.get("Post").unwrap()
    }

    #[test]
    fn test_validate_maps_relationship_names_and_parses_text() {
        let model = post_model();
        let row = Changes::new()
            .set("author", 7)
            .set("published_at", "2025-01-02T03:04:05Z")
            .validate(&model, false)
            .unwrap();
        assert_eq!(row.get("author_id"), Some(&Value::Int(7)));
        assert!(matches!(row.get("published_at"), Some(Value::Timestamp(_))));
    }

    #[test]
    fn test_unknown_field_and_primary_key_rejected() {
        let model = post_model();
        let unknown = Changes::new().set("subtitle", "x").validate(&model, false);
        assert!(matches!(unknown, Err(OrmError::Validation(_))));

        let pk = Changes::new().set("id", 3).validate(&model, false);
        assert!(matches!(pk, Err(OrmError::Validation(_))));
    }

    #[test]
    fn test_apply_to_updates_entity() {
        let model = post_model();
        let mut post = Post {
            id: Some(1),
            title: "Draft".into(),
            author_id: None,
        };
        let changes = Changes::from_json(json!({"title": "Final", "author": 2})).unwrap();
        changes.apply_to(&mut post, &model).unwrap();
        assert_eq!(post.title, "Final");
        assert_eq!(post.author_id, Some(2));

        let err = Changes::new().set("id", 9).apply_to(&mut post, &model).unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
        // Restating the current key is not a change
        Changes::new().set("id", 1).apply_to(&mut post, &model).unwrap();
    }

    #[test]
    fn test_type_mismatch_is_validation_error() {
        let model = post_model();
        let err = Changes::new().set("title", 5).validate(&model, false).unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
    }
}
