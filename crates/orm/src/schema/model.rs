//! Model descriptors - fields, constraints and symbolic relationships
//!
//! Relationship targets are recorded by model name only. Nothing here looks
//! another model up, so models may reference each other in any declaration
//! order; `SchemaRegistry::finalize` resolves the names.

use serde::{Deserialize, Serialize};

use super::field::{FieldDescriptor, FieldType};

/// What happens to dependents when a referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OnDelete {
    Cascade,
    Restrict,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::Restrict => "RESTRICT",
        }
    }
}

/// Defines the type of relationship between models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// This model holds the foreign key (belongs-to)
    ToOne,
    /// The target holds a foreign key pointing back here (has-many)
    ToManyReverse,
    /// Linked through a junction model holding two foreign keys
    ManyToMany,
}

impl RelationshipKind {
    /// Returns true if this relationship returns a collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::ToManyReverse | Self::ManyToMany)
    }
}

/// Declared relationship, unresolved
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationshipKind,
    /// Target model name
    pub target: String,
    pub on_delete: OnDelete,
    /// Local foreign-key column for `ToOne`
    pub column: Option<String>,
    /// Name of the target's `ToOne` relationship pointing back, for `ToManyReverse`
    pub via: Option<String>,
    /// Junction model name, for `ManyToMany`
    pub through: Option<String>,
}

/// Declared table constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintDescriptor {
    Unique { field: String },
    UniqueTogether { fields: Vec<String> },
    ForeignKey {
        column: String,
        target: String,
        on_delete: OnDelete,
    },
}

/// Structural declaration of a persisted entity
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDescriptor>,
    pub constraints: Vec<ConstraintDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            constraints: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add a field; a `unique` flag also records a unique constraint
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        if field.unique && !field.primary_key {
            self.constraints.push(ConstraintDescriptor::Unique {
                field: field.name.clone(),
            });
        }
        self.fields.push(field);
        self
    }

    /// Declare a to-one relationship `name` stored in column `{name}_id`
    pub fn foreign_key(self, name: &str, target: &str, on_delete: OnDelete) -> Self {
        self.foreign_key_column(name, target, on_delete, true)
    }

    /// Like `foreign_key`, with a non-null column
    pub fn required_foreign_key(self, name: &str, target: &str, on_delete: OnDelete) -> Self {
        self.foreign_key_column(name, target, on_delete, false)
    }

    fn foreign_key_column(mut self, name: &str, target: &str, on_delete: OnDelete, nullable: bool) -> Self {
        let column = format!("{}_id", name);
        let mut field = FieldDescriptor::new(column.clone(), FieldType::BigInteger);
        field.nullable = nullable;
        self.fields.push(field);
        self.constraints.push(ConstraintDescriptor::ForeignKey {
            column: column.clone(),
            target: target.to_string(),
            on_delete,
        });
        self.relationships.push(RelationshipDescriptor {
            name: name.to_string(),
            kind: RelationshipKind::ToOne,
            target: target.to_string(),
            on_delete,
            column: Some(column),
            via: None,
            through: None,
        });
        self
    }

    /// Declare a reverse collection: rows of `target` whose `via` relationship points here
    pub fn reverse(mut self, name: &str, target: &str, via: &str) -> Self {
        self.relationships.push(RelationshipDescriptor {
            name: name.to_string(),
            kind: RelationshipKind::ToManyReverse,
            target: target.to_string(),
            on_delete: OnDelete::Cascade,
            column: None,
            via: Some(via.to_string()),
            through: None,
        });
        self
    }

    /// Declare a many-to-many collection through a junction model
    pub fn many_to_many(mut self, name: &str, target: &str, through: &str) -> Self {
        self.relationships.push(RelationshipDescriptor {
            name: name.to_string(),
            kind: RelationshipKind::ManyToMany,
            target: target.to_string(),
            on_delete: OnDelete::Cascade,
            column: None,
            via: None,
            through: Some(through.to_string()),
        });
        self
    }

    /// Unique-together over fields or to-one relationship names
    pub fn unique_together(mut self, fields: &[&str]) -> Self {
        self.constraints.push(ConstraintDescriptor::UniqueTogether {
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Column name for a field or to-one relationship name
    pub fn column_for(&self, name: &str) -> Option<&str> {
        if let Some(field) = self.get_field(name) {
            return Some(&field.name);
        }
        self.get_relationship(name)
            .filter(|r| r.kind == RelationshipKind::ToOne)
            .and_then(|r| r.column.as_deref())
    }

    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }
}
