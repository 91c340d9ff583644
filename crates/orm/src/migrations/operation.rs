//! Schema operations
//!
//! Every operation carries the full definition of what it adds or removes,
//! so its reverse can be produced without consulting any other state.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::snapshot::{ColumnSchema, ConstraintSchema, NamedConstraint, TableSchema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable { table: TableSchema },
    DropTable { table: TableSchema },
    AddColumn { table: String, column: ColumnSchema },
    DropColumn { table: String, column: ColumnSchema },
    AddConstraint { table: String, constraint: NamedConstraint },
    DropConstraint { table: String, constraint: NamedConstraint },
}

impl Operation {
    /// The operation undoing this one
    pub fn reverse(&self) -> Operation {
        match self.clone() {
            Operation::CreateTable { table } => Operation::DropTable { table },
            Operation::DropTable { table } => Operation::CreateTable { table },
            Operation::AddColumn { table, column } => Operation::DropColumn { table, column },
            Operation::DropColumn { table, column } => Operation::AddColumn { table, column },
            Operation::AddConstraint { table, constraint } => {
                Operation::DropConstraint { table, constraint }
            }
            Operation::DropConstraint { table, constraint } => {
                Operation::AddConstraint { table, constraint }
            }
        }
    }

    /// Table the operation touches
    pub fn table_name(&self) -> &str {
        match self {
            Operation::CreateTable { table } | Operation::DropTable { table } => &table.name,
            Operation::AddColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::AddConstraint { table, .. }
            | Operation::DropConstraint { table, .. } => table,
        }
    }

    /// Snake-case label used to name a migration, e.g. `create_users_table`
    pub fn label(&self) -> String {
        match self {
            Operation::CreateTable { table } => format!("create_{}_table", table.name),
            Operation::DropTable { table } => format!("drop_{}_table", table.name),
            Operation::AddColumn { table, column } => format!("add_{}_to_{}", column.name, table),
            Operation::DropColumn { table, column } => {
                format!("remove_{}_from_{}", column.name, table)
            }
            Operation::AddConstraint { constraint, .. } => format!("add_{}", constraint.name),
            Operation::DropConstraint { constraint, .. } => format!("drop_{}", constraint.name),
        }
    }

    /// Human-readable summary
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateTable { table } => {
                let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
                format!("Create table {} ({})", table.name, columns.join(", "))
            }
            Operation::DropTable { table } => format!("Drop table {}", table.name),
            Operation::AddColumn { table, column } => {
                format!("Add column {}.{} ({:?})", table, column.name, column.field_type)
            }
            Operation::DropColumn { table, column } => {
                format!("Drop column {}.{}", table, column.name)
            }
            Operation::AddConstraint { table, constraint } => {
                format!("Add {} on {}", describe_constraint(constraint), table)
            }
            Operation::DropConstraint { table, constraint } => {
                format!("Drop constraint {} on {}", constraint.name, table)
            }
        }
    }
}

fn describe_constraint(constraint: &NamedConstraint) -> String {
    match &constraint.constraint {
        ConstraintSchema::Unique { columns } => {
            format!("unique constraint {} ({})", constraint.name, columns.join(", "))
        }
        ConstraintSchema::ForeignKey { column, ref_table, ref_column, on_delete } => format!(
            "foreign key {} ({} -> {}.{} ON DELETE {})",
            constraint.name,
            column,
            ref_table,
            ref_column,
            on_delete.as_sql()
        ),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
