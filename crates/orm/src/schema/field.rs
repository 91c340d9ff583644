//! Field descriptors and logical column types

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::value::Value;

/// Logical type of a persisted field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    BigInteger,
    Float,
    Boolean,
    Text,
    Timestamp,
    Date,
    Uuid,
    Json,
}

impl FieldType {
    pub fn is_integer(self) -> bool {
        matches!(self, FieldType::Integer | FieldType::BigInteger)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, FieldType::Timestamp | FieldType::Date)
    }

    /// Whether a foreign key column of type `self` can reference a key of type `target`
    pub fn can_reference(self, target: FieldType) -> bool {
        self == target || (self.is_integer() && target.is_integer())
    }

    /// Whether `value` is storable in a column of this type (null aside)
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Integer | FieldType::BigInteger, Value::Int(_)) => true,
            (FieldType::Float, Value::Float(_) | Value::Int(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Text, Value::Text(_)) => true,
            (FieldType::Timestamp, Value::Timestamp(_)) => true,
            (FieldType::Date, Value::Date(_)) => true,
            (FieldType::Uuid, Value::Uuid(_)) => true,
            (FieldType::Json, _) => true,
            _ => false,
        }
    }

    /// Normalize a value already accepted by this type
    pub fn normalize(self, value: Value) -> Value {
        match (self, value) {
            (FieldType::Float, Value::Int(i)) => Value::Float(i as f64),
            (FieldType::Json, Value::Json(j)) => Value::Json(j),
            (FieldType::Json, Value::Null) => Value::Null,
            (FieldType::Json, other) => Value::Json(other.to_json()),
            (_, other) => other,
        }
    }

    /// Decode a JSON value into a typed `Value` for a column of this type
    pub fn coerce(self, json: JsonValue) -> OrmResult<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |json: &JsonValue| {
            OrmError::Serialization(format!("cannot decode {} as {:?}", json, self))
        };
        match self {
            FieldType::Integer | FieldType::BigInteger => json
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| mismatch(&json)),
            FieldType::Float => json.as_f64().map(Value::Float).ok_or_else(|| mismatch(&json)),
            FieldType::Boolean => match &json {
                JsonValue::Bool(b) => Ok(Value::Bool(*b)),
                JsonValue::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
                JsonValue::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
                _ => Err(mismatch(&json)),
            },
            FieldType::Text => match json {
                JsonValue::String(s) => Ok(Value::Text(s)),
                other => Err(mismatch(&other)),
            },
            FieldType::Timestamp => {
                let raw = json.as_str().ok_or_else(|| mismatch(&json))?;
                parse_timestamp(raw)
                    .map(Value::Timestamp)
                    .ok_or_else(|| mismatch(&json))
            }
            FieldType::Date => {
                let raw = json.as_str().ok_or_else(|| mismatch(&json))?;
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(Value::Date)
                    .map_err(|_| mismatch(&json))
            }
            FieldType::Uuid => {
                let raw = json.as_str().ok_or_else(|| mismatch(&json))?;
                uuid::Uuid::parse_str(raw)
                    .map(Value::Uuid)
                    .map_err(|_| mismatch(&json))
            }
            FieldType::Json => Ok(Value::Json(json)),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Postgres renders timestamptz in JSON with a short offset ("+00:00" or "+00")
    for format in ["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

/// Structural declaration of one persisted field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    /// Language-level default, filled in by `create` when the caller omits the field
    pub default: Option<Value>,
    /// Storage-level default expression, e.g. `CURRENT_TIMESTAMP`
    pub db_default: Option<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub index: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            default: None,
            db_default: None,
            primary_key: false,
            auto_increment: false,
            unique: false,
            index: false,
        }
    }

    /// Auto-incrementing big integer primary key named `id`
    pub fn id() -> Self {
        Self::new("id", FieldType::BigInteger).primary_key()
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn db_default(mut self, expression: impl Into<String>) -> Self {
        self.db_default = Some(expression.into());
        self
    }

    /// Mark as primary key; integer keys auto-increment
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self.auto_increment = self.field_type.is_integer();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Whether the store fills this column when an insert omits it
    pub fn has_server_default(&self) -> bool {
        self.auto_increment || self.db_default.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_key_builder() {
        let id = FieldDescriptor::id();
        assert!(id.primary_key);
        assert!(id.auto_increment);
        assert!(!id.nullable);

        let code = FieldDescriptor::text("code").primary_key();
        assert!(!code.auto_increment);
    }

    #[test]
    fn test_coerce_postgres_timestamp() {
        let value = FieldType::Timestamp
            .coerce(json!("2025-12-30T11:45:41.123+00:00"))
            .unwrap();
        assert!(matches!(value, Value::Timestamp(_)));
    }

    #[test]
    fn test_coerce_rejects_mismatch() {
        assert!(FieldType::Integer.coerce(json!("12")).is_err());
        assert_eq!(FieldType::Boolean.coerce(json!(0)).unwrap(), Value::Bool(false));
        assert_eq!(FieldType::Text.coerce(JsonValue::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_accepts_and_normalize() {
        assert!(FieldType::Float.accepts(&Value::Int(3)));
        assert_eq!(FieldType::Float.normalize(Value::Int(3)), Value::Float(3.0));
        assert!(!FieldType::Text.accepts(&Value::Int(3)));
        assert!(FieldType::BigInteger.can_reference(FieldType::Integer));
        assert!(!FieldType::Text.can_reference(FieldType::BigInteger));
    }
}
