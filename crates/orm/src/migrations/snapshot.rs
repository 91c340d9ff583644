//! Schema snapshots - the virtual schema migrations are replayed against
//!
//! A snapshot is what the store would look like after a sequence of
//! operations, computed without touching the store. `extract` builds the
//! target snapshot from a finalized registry; `apply` simulates one
//! operation and refuses anything the store would refuse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::operation::Operation;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ConstraintDescriptor, FieldDescriptor, FieldType, OnDelete, SchemaRegistry};

/// Persisted definition of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_default: Option<String>,
    #[serde(default)]
    pub indexed: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            db_default: None,
            indexed: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

impl From<&FieldDescriptor> for ColumnSchema {
    fn from(field: &FieldDescriptor) -> Self {
        Self {
            name: field.name.clone(),
            field_type: field.field_type,
            nullable: field.nullable,
            primary_key: field.primary_key,
            auto_increment: field.auto_increment,
            db_default: field.db_default.clone(),
            indexed: field.index && !field.primary_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintSchema {
    Unique {
        columns: Vec<String>,
    },
    ForeignKey {
        column: String,
        ref_table: String,
        ref_column: String,
        on_delete: OnDelete,
    },
}

/// Table constraint with its store-level name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedConstraint {
    pub name: String,
    #[serde(flatten)]
    pub constraint: ConstraintSchema,
}

impl NamedConstraint {
    pub fn unique(table: &str, columns: Vec<String>) -> Self {
        Self {
            name: format!("uq_{}_{}", table, columns.join("_")),
            constraint: ConstraintSchema::Unique { columns },
        }
    }

    pub fn foreign_key(
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
        on_delete: OnDelete,
    ) -> Self {
        Self {
            name: format!("fk_{}_{}", table, column),
            constraint: ConstraintSchema::ForeignKey {
                column: column.to_string(),
                ref_table: ref_table.to_string(),
                ref_column: ref_column.to_string(),
                on_delete,
            },
        }
    }

    /// Columns of the owning table the constraint covers
    pub fn columns(&self) -> Vec<&str> {
        match &self.constraint {
            ConstraintSchema::Unique { columns } => columns.iter().map(String::as_str).collect(),
            ConstraintSchema::ForeignKey { column, .. } => vec![column.as_str()],
        }
    }

    /// Referenced table, for foreign keys
    pub fn references(&self) -> Option<&str> {
        match &self.constraint {
            ConstraintSchema::ForeignKey { ref_table, .. } => Some(ref_table),
            ConstraintSchema::Unique { .. } => None,
        }
    }
}

/// Persisted definition of a table. Equality ignores column order.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub constraints: Vec<NamedConstraint>,
}

impl PartialEq for TableSchema {
    fn eq(&self, other: &Self) -> bool {
        fn sorted(t: &TableSchema) -> (Vec<&ColumnSchema>, Vec<&NamedConstraint>) {
            let mut columns: Vec<&ColumnSchema> = t.columns.iter().collect();
            columns.sort_by(|a, b| a.name.cmp(&b.name));
            let mut constraints: Vec<&NamedConstraint> = t.constraints.iter().collect();
            constraints.sort_by(|a, b| a.name.cmp(&b.name));
            (columns, constraints)
        }
        self.name == other.name && sorted(self) == sorted(other)
    }
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_constraint(&self, name: &str) -> Option<&NamedConstraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &NamedConstraint> {
        self.constraints.iter().filter(|c| c.references().is_some())
    }
}

/// Set of tables keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target schema described by a finalized registry
    pub fn extract(registry: &SchemaRegistry) -> OrmResult<Self> {
        let mut snapshot = Self::new();
        for model in registry.models()? {
            let table = model.table();
            let mut schema = TableSchema::new(table);
            schema.columns = model.fields().iter().map(ColumnSchema::from).collect();

            for constraint in model.constraints() {
                let named = match constraint {
                    ConstraintDescriptor::Unique { field } => {
                        NamedConstraint::unique(table, vec![field.clone()])
                    }
                    ConstraintDescriptor::UniqueTogether { fields } => {
                        NamedConstraint::unique(table, fields.clone())
                    }
                    ConstraintDescriptor::ForeignKey { column, .. } => {
                        let fk = model
                            .foreign_keys()
                            .iter()
                            .find(|fk| &fk.column == column)
                            .ok_or_else(|| {
                                OrmError::Schema(format!("unresolved foreign key {}.{}", table, column))
                            })?;
                        NamedConstraint::foreign_key(
                            table,
                            column,
                            &fk.target_table,
                            &fk.target_column,
                            fk.on_delete,
                        )
                    }
                };
                schema.constraints.push(named);
            }
            schema.constraints.sort_by(|a, b| a.name.cmp(&b.name));
            snapshot.tables.insert(table.to_string(), schema);
        }
        Ok(snapshot)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Foreign keys in other tables pointing at `table`, as (owning table, constraint)
    pub fn referencing(&self, table: &str) -> Vec<(&TableSchema, &NamedConstraint)> {
        self.tables
            .values()
            .flat_map(|t| t.foreign_keys().map(move |fk| (t, fk)))
            .filter(|(_, fk)| fk.references() == Some(table))
            .collect()
    }

    /// Simulate one operation
    pub fn apply(&mut self, operation: &Operation) -> OrmResult<()> {
        let conflict = |reason: String| {
            OrmError::MigrationConflict(format!("{}: {}", operation.describe(), reason))
        };

        match operation {
            Operation::CreateTable { table } => {
                if self.tables.contains_key(&table.name) {
                    return Err(conflict(format!("table '{}' already exists", table.name)));
                }
                let mut seen = std::collections::HashSet::new();
                for column in &table.columns {
                    if !seen.insert(column.name.as_str()) {
                        return Err(conflict(format!("duplicate column '{}'", column.name)));
                    }
                }
                for constraint in &table.constraints {
                    self.check_constraint(table, constraint).map_err(conflict)?;
                }
                self.tables.insert(table.name.clone(), table.clone());
            }
            Operation::DropTable { table } => {
                if !self.tables.contains_key(&table.name) {
                    return Err(conflict(format!("table '{}' does not exist", table.name)));
                }
                let dependents: Vec<String> = self
                    .referencing(&table.name)
                    .into_iter()
                    .filter(|(owner, _)| owner.name != table.name)
                    .map(|(_, fk)| fk.name.clone())
                    .collect();
                if !dependents.is_empty() {
                    return Err(conflict(format!(
                        "table '{}' is still referenced by {}",
                        table.name,
                        dependents.join(", ")
                    )));
                }
                self.tables.remove(&table.name);
            }
            Operation::AddColumn { table, column } => {
                let schema = self.table_mut(table).map_err(conflict)?;
                if schema.get_column(&column.name).is_some() {
                    return Err(conflict(format!("column '{}.{}' already exists", table, column.name)));
                }
                if column.primary_key {
                    return Err(conflict("cannot add a primary key column".to_string()));
                }
                schema.columns.push(column.clone());
            }
            Operation::DropColumn { table, column } => {
                let schema = self.table_mut(table).map_err(conflict)?;
                let existing = schema
                    .get_column(&column.name)
                    .ok_or_else(|| conflict(format!("column '{}.{}' does not exist", table, column.name)))?;
                if existing.primary_key {
                    return Err(conflict("cannot drop the primary key column".to_string()));
                }
                if let Some(c) = schema
                    .constraints
                    .iter()
                    .find(|c| c.columns().contains(&column.name.as_str()))
                {
                    return Err(conflict(format!(
                        "column '{}.{}' is used by constraint '{}'",
                        table, column.name, c.name
                    )));
                }
                schema.columns.retain(|c| c.name != column.name);
            }
            Operation::AddConstraint { table, constraint } => {
                let schema = self
                    .tables
                    .get(table)
                    .ok_or_else(|| conflict(format!("table '{}' does not exist", table)))?;
                if schema.get_constraint(&constraint.name).is_some() {
                    return Err(conflict(format!("constraint '{}' already exists", constraint.name)));
                }
                self.check_constraint(schema, constraint).map_err(conflict)?;
                let schema = self.table_mut(table).map_err(conflict)?;
                schema.constraints.push(constraint.clone());
                schema.constraints.sort_by(|a, b| a.name.cmp(&b.name));
            }
            Operation::DropConstraint { table, constraint } => {
                let schema = self.table_mut(table).map_err(conflict)?;
                if schema.get_constraint(&constraint.name).is_none() {
                    return Err(conflict(format!("constraint '{}' does not exist", constraint.name)));
                }
                schema.constraints.retain(|c| c.name != constraint.name);
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema, String> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| format!("table '{}' does not exist", name))
    }

    /// Columns exist, and a foreign key's target exists (or is the table itself)
    fn check_constraint(&self, table: &TableSchema, constraint: &NamedConstraint) -> Result<(), String> {
        for column in constraint.columns() {
            if table.get_column(column).is_none() {
                return Err(format!(
                    "constraint '{}' names unknown column '{}.{}'",
                    constraint.name, table.name, column
                ));
            }
        }
        if let ConstraintSchema::ForeignKey { ref_table, ref_column, .. } = &constraint.constraint {
            let target = if ref_table == &table.name {
                Some(table)
            } else {
                self.tables.get(ref_table)
            };
            let target = target.ok_or_else(|| {
                format!(
                    "foreign key '{}' references non-existent table '{}'",
                    constraint.name, ref_table
                )
            })?;
            if target.get_column(ref_column).is_none() {
                return Err(format!(
                    "foreign key '{}' references unknown column '{}.{}'",
                    constraint.name, ref_table, ref_column
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key())
            .column(ColumnSchema::new("username", FieldType::Text))
    }

    fn posts() -> TableSchema {
        let mut posts = TableSchema::new("posts")
            .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key())
            .column(ColumnSchema::new("author_id", FieldType::BigInteger).nullable());
        posts.constraints.push(NamedConstraint::foreign_key(
            "posts",
            "author_id",
            "users",
            "id",
            OnDelete::Cascade,
        ));
        posts
    }

    #[test]
    fn test_create_requires_referenced_table() {
        let mut snapshot = SchemaSnapshot::new();
        let err = snapshot
            .apply(&Operation::CreateTable { table: posts() })
            .unwrap_err();
        assert!(matches!(err, OrmError::MigrationConflict(ref m) if m.contains("non-existent table 'users'")));

        snapshot.apply(&Operation::CreateTable { table: users() }).unwrap();
        snapshot.apply(&Operation::CreateTable { table: posts() }).unwrap();
        assert!(snapshot.contains_table("posts"));
    }

    #[test]
    fn test_drop_referenced_table_conflicts() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.apply(&Operation::CreateTable { table: users() }).unwrap();
        snapshot.apply(&Operation::CreateTable { table: posts() }).unwrap();
        let err = snapshot
            .apply(&Operation::DropTable { table: users() })
            .unwrap_err();
        assert!(err.to_string().contains("fk_posts_author_id"));
    }

    #[test]
    fn test_column_conflicts() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.apply(&Operation::CreateTable { table: users() }).unwrap();

        let add = Operation::AddColumn {
            table: "users".into(),
            column: ColumnSchema::new("username", FieldType::Text),
        };
        assert!(matches!(snapshot.apply(&add), Err(OrmError::MigrationConflict(_))));

        let drop = Operation::DropColumn {
            table: "users".into(),
            column: ColumnSchema::new("email", FieldType::Text),
        };
        assert!(matches!(snapshot.apply(&drop), Err(OrmError::MigrationConflict(_))));
    }

    #[test]
    fn test_table_equality_ignores_column_order() {
        let mut reordered = users();
        reordered.columns.reverse();
        assert_eq!(users(), reordered);
    }

    #[test]
    fn test_self_reference_allowed() {
        let mut categories = TableSchema::new("categories")
            .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key())
            .column(ColumnSchema::new("parent_id", FieldType::BigInteger).nullable());
        categories.constraints.push(NamedConstraint::foreign_key(
            "categories",
            "parent_id",
            "categories",
            "id",
            OnDelete::Cascade,
        ));
        let mut snapshot = SchemaSnapshot::new();
        snapshot
            .apply(&Operation::CreateTable { table: categories.clone() })
            .unwrap();
        snapshot.apply(&Operation::DropTable { table: categories }).unwrap();
        assert!(snapshot.is_empty());
    }
}
