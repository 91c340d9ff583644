//! `Q` - composable filter expressions
//!
//! Leaves name a field path (`title`, `created_at__gte`, `author__exact`)
//! and a value. Nodes combine with `&`, `|` and `!`. Nothing is checked
//! until the tree is resolved against a model, which happens when it is
//! handed to `QuerySet::filter` or `QuerySet::exclude`.

use std::ops::{BitAnd, BitOr, Not};

use super::lookup::Lookup;
use super::predicate::Predicate;
use crate::error::{OrmError, OrmResult};
use crate::schema::{FieldType, ResolvedModel};
use crate::value::Value;

/// Filter expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    Leaf { path: String, value: Value },
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    /// Leaf from a lookup-suffixed path: `Q::new("created_at__gte", ts)`
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Q::Leaf {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Keyword equality: `Q::eq("published", true)`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value)
    }

    /// Conjunction of keyword equalities
    pub fn all<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Q::And(pairs.into_iter().map(|(k, v)| Q::new(k, v)).collect())
    }

    /// Resolve every path against `model`
    pub fn resolve(&self, model: &ResolvedModel) -> OrmResult<Predicate> {
        match self {
            Q::Leaf { path, value } => resolve_leaf(model, path, value),
            Q::And(children) => Ok(Predicate::And(
                children.iter().map(|c| c.resolve(model)).collect::<OrmResult<_>>()?,
            )),
            Q::Or(children) => Ok(Predicate::Or(
                children.iter().map(|c| c.resolve(model)).collect::<OrmResult<_>>()?,
            )),
            Q::Not(child) => Ok(Predicate::Not(Box::new(child.resolve(model)?))),
        }
    }
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        match (self, rhs) {
            (Q::And(mut left), Q::And(right)) => {
                left.extend(right);
                Q::And(left)
            }
            (Q::And(mut left), right) => {
                left.push(right);
                Q::And(left)
            }
            (left, right) => Q::And(vec![left, right]),
        }
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        match (self, rhs) {
            (Q::Or(mut left), Q::Or(right)) => {
                left.extend(right);
                Q::Or(left)
            }
            (Q::Or(mut left), right) => {
                left.push(right);
                Q::Or(left)
            }
            (left, right) => Q::Or(vec![left, right]),
        }
    }
}

impl Not for Q {
    type Output = Q;

    fn not(self) -> Q {
        Q::Not(Box::new(self))
    }
}

fn resolve_leaf(model: &ResolvedModel, path: &str, value: &Value) -> OrmResult<Predicate> {
    let mut parts = path.split("__");
    let name = parts.next().unwrap_or_default();
    let lookup = match (parts.next(), parts.next()) {
        (None, _) => Lookup::Exact,
        (Some(suffix), None) => Lookup::parse(suffix).ok_or_else(|| {
            OrmError::Query(format!("unknown lookup '{}' in '{}'", suffix, path))
        })?,
        (Some(_), Some(_)) => {
            return Err(OrmError::Query(format!(
                "'{}' spans more than one relationship; multi-hop paths are not supported",
                path
            )))
        }
    };

    let field = model.resolve_field(name).ok_or_else(|| {
        OrmError::Query(format!("unknown field '{}' on model '{}'", name, model.name()))
    })?;
    let field_type = field.field_type;
    let ill_typed = |what: &str| {
        OrmError::Query(format!(
            "'{}' on {}.{} expects {}, got {}",
            lookup,
            model.name(),
            field.name,
            what,
            value.type_name()
        ))
    };
    let scalar = |v: &Value| -> OrmResult<Value> {
        if v.is_null() || !field_type.accepts(v) {
            return Err(ill_typed(&format!("a non-null {:?} value", field_type)));
        }
        Ok(field_type.normalize(v.clone()))
    };

    let value = match lookup {
        Lookup::Exact => {
            if !field_type.accepts(value) {
                return Err(ill_typed(&format!("a {:?} value", field_type)));
            }
            field_type.normalize(value.clone())
        }
        Lookup::Gt | Lookup::Gte | Lookup::Lt | Lookup::Lte => scalar(value)?,
        Lookup::IContains => match (field_type, value) {
            (FieldType::Text, Value::Text(_)) => value.clone(),
            _ => return Err(ill_typed("a text field and a text value")),
        },
        Lookup::In => match value {
            Value::List(items) => Value::List(items.iter().map(scalar).collect::<OrmResult<_>>()?),
            _ => return Err(ill_typed("a list")),
        },
        Lookup::Range => match value {
            Value::List(bounds) if bounds.len() == 2 => {
                Value::List(bounds.iter().map(scalar).collect::<OrmResult<_>>()?)
            }
            _ => return Err(ill_typed("a two-element list")),
        },
        Lookup::Year | Lookup::Month | Lookup::Day => match value {
            Value::Int(_) if field_type.is_temporal() => value.clone(),
            _ => return Err(ill_typed("a date or timestamp field and an integer")),
        },
    };

    Ok(Predicate::Compare {
        column: field.name.clone(),
        lookup,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, ModelDescriptor, OnDelete, SchemaRegistry};

    fn post_model() -> std::sync::Arc<ResolvedModel> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                ModelDescriptor::new("User", "users")
                    .field(FieldDescriptor::id())
                    .field(FieldDescriptor::text("username")),
            )
            .unwrap();
        registry
            .register(
                ModelDescriptor::new("Post", "posts")
                    .field(FieldDescriptor::id())
                    .field(FieldDescriptor::text("title"))
                    .field(FieldDescriptor::boolean("published").default(false))
                    .field(FieldDescriptor::timestamp("created_at"))
                    .foreign_key("author", "User", OnDelete::Cascade),
            )
            .unwrap();
        registry.finalize().unwrap();
        registry.get("Post").unwrap()
    }

    #[test]
    fn test_keyword_and_suffix_resolution() {
        let model = post_model();
        let p = Q::eq("published", true).resolve(&model).unwrap();
        assert_eq!(p, Predicate::compare("published", Lookup::Exact, true));

        let p = Q::new("author", 4).resolve(&model).unwrap();
        assert_eq!(p, Predicate::compare("author_id", Lookup::Exact, 4));

        let p = Q::new("created_at__year", 2024).resolve(&model).unwrap();
        assert_eq!(p, Predicate::compare("created_at", Lookup::Year, 2024));
    }

    #[test]
    fn test_unknown_lookup_and_field() {
        let model = post_model();
        let err = Q::new("title__startswith", "a").resolve(&model).unwrap_err();
        assert!(matches!(err, OrmError::Query(ref m) if m.contains("unknown lookup 'startswith'")));

        let err = Q::new("subtitle", "a").resolve(&model).unwrap_err();
        assert!(matches!(err, OrmError::Query(ref m) if m.contains("unknown field 'subtitle'")));

        let err = Q::new("author__username__icontains", "a").resolve(&model).unwrap_err();
        assert!(matches!(err, OrmError::Query(_)));
    }

    #[test]
    fn test_type_checks() {
        let model = post_model();
        assert!(Q::new("id__in", 3).resolve(&model).is_err());
        assert!(Q::new("id__range", vec![1i64]).resolve(&model).is_err());
        assert!(Q::new("title__year", 2024).resolve(&model).is_err());
        assert!(Q::new("id__icontains", "1").resolve(&model).is_err());
        assert!(Q::new("title", 5).resolve(&model).is_err());
        assert!(Q::new("id__gt", Value::Null).resolve(&model).is_err());
        assert!(Q::new("id__in", vec![1i64, 2]).resolve(&model).is_ok());
    }

    #[test]
    fn test_operators_build_trees() {
        let q = Q::new("title__icontains", "rust") | Q::new("title__icontains", "tokio");
        let q = q & !Q::eq("published", false);
        match q {
            Q::And(children) => {
                assert!(matches!(children[0], Q::Or(ref or) if or.len() == 2));
                assert!(matches!(children[1], Q::Not(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }
}
