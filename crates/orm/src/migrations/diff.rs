//! Schema diff
//!
//! Produces the operations turning `current` into `target`, ordered so they
//! apply cleanly in sequence: creates, then alters (columns before
//! constraints), then drops (constraints, columns, tables). Within a kind,
//! operations are alphabetical by table, then by column or constraint name.
//! A constraint redefined under the same name is dropped before its new
//! definition is added.
//!
//! New tables are created in dependency order. When new tables reference
//! each other in a cycle, the foreign keys of the alphabetically first
//! table on the cycle are split off and added after every table exists.
//! Tables that only lead into a cycle keep their foreign keys.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::operation::Operation;
use super::snapshot::{NamedConstraint, SchemaSnapshot, TableSchema};
use crate::error::{OrmError, OrmResult};

pub fn diff(target: &SchemaSnapshot, current: &SchemaSnapshot) -> OrmResult<Vec<Operation>> {
    let mut creates = Vec::new();
    let mut add_columns = Vec::new();
    let mut redefined = Vec::new();
    let mut add_constraints = Vec::new();
    let mut drop_constraints = Vec::new();
    let mut drop_columns = Vec::new();

    let new_tables: BTreeMap<&str, &TableSchema> = target
        .tables()
        .filter(|t| !current.contains_table(&t.name))
        .map(|t| (t.name.as_str(), t))
        .collect();
    let (ordered, deferred) = creation_order(&new_tables);
    for table in ordered {
        creates.push(Operation::CreateTable { table });
    }
    add_constraints.extend(deferred);

    for wanted in target.tables() {
        let Some(existing) = current.table(&wanted.name) else {
            continue;
        };

        for column in &wanted.columns {
            match existing.get_column(&column.name) {
                None => add_columns.push(Operation::AddColumn {
                    table: wanted.name.clone(),
                    column: column.clone(),
                }),
                Some(old) if old != column => {
                    return Err(OrmError::MigrationConflict(format!(
                        "column '{}.{}' changed definition; altering columns is not supported",
                        wanted.name, column.name
                    )))
                }
                Some(_) => {}
            }
        }
        for column in &existing.columns {
            if wanted.get_column(&column.name).is_none() {
                drop_columns.push(Operation::DropColumn {
                    table: wanted.name.clone(),
                    column: column.clone(),
                });
            }
        }

        for constraint in &wanted.constraints {
            match existing.get_constraint(&constraint.name) {
                Some(old) if old == constraint => {}
                Some(old) => {
                    redefined.push(Operation::DropConstraint {
                        table: wanted.name.clone(),
                        constraint: old.clone(),
                    });
                    add_constraints.push(Operation::AddConstraint {
                        table: wanted.name.clone(),
                        constraint: constraint.clone(),
                    });
                }
                None => add_constraints.push(Operation::AddConstraint {
                    table: wanted.name.clone(),
                    constraint: constraint.clone(),
                }),
            }
        }
        for constraint in &existing.constraints {
            if wanted.get_constraint(&constraint.name).is_none() {
                drop_constraints.push(Operation::DropConstraint {
                    table: wanted.name.clone(),
                    constraint: constraint.clone(),
                });
            }
        }
    }

    let dropped: BTreeMap<&str, &TableSchema> = current
        .tables()
        .filter(|t| !target.contains_table(&t.name))
        .map(|t| (t.name.as_str(), t))
        .collect();
    let (drop_tables, cycle_breaks) = drop_order(&dropped);
    drop_constraints.extend(cycle_breaks);

    for ops in [
        &mut add_columns,
        &mut redefined,
        &mut add_constraints,
        &mut drop_constraints,
        &mut drop_columns,
    ] {
        ops.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    }

    let mut operations = creates;
    operations.extend(add_columns);
    operations.extend(redefined);
    operations.extend(add_constraints);
    operations.extend(drop_constraints);
    operations.extend(drop_columns);
    operations.extend(drop_tables);

    debug!("Schema diff produced {} operations", operations.len());
    Ok(operations)
}

fn sort_key(op: &Operation) -> (&str, &str) {
    let name = match op {
        Operation::AddColumn { column, .. } | Operation::DropColumn { column, .. } => &column.name,
        Operation::AddConstraint { constraint, .. } | Operation::DropConstraint { constraint, .. } => {
            &constraint.name
        }
        Operation::CreateTable { table } | Operation::DropTable { table } => &table.name,
    };
    (op.table_name(), name)
}

/// Kahn's algorithm over "references" edges between new tables, with
/// alphabetical tie-breaking. Returns tables to create (cycle-breaking
/// foreign keys removed) and the deferred `AddConstraint`s.
fn creation_order(tables: &BTreeMap<&str, &TableSchema>) -> (Vec<TableSchema>, Vec<Operation>) {
    let mut pending: BTreeMap<&str, TableSchema> =
        tables.iter().map(|(name, t)| (*name, (*t).clone())).collect();
    let mut ordered = Vec::new();
    let mut deferred = Vec::new();

    while !pending.is_empty() {
        let ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(name, table)| unmet_dependencies(name, table, &pending).is_empty())
            .map(|(name, _)| *name)
            .collect();

        match ready.iter().next() {
            Some(name) => {
                if let Some(table) = pending.remove(name) {
                    ordered.push(table);
                }
            }
            None => {
                // Every remaining table waits on another, so following unmet
                // dependencies must reach a cycle
                let Some(name) = cycle_member(&pending) else {
                    break;
                };
                let waits_on = |fk: &NamedConstraint| {
                    fk.references()
                        .is_some_and(|r| r != name && pending.contains_key(r))
                };
                let (split, kept): (Vec<NamedConstraint>, Vec<NamedConstraint>) = pending[name.as_str()]
                    .constraints
                    .iter()
                    .cloned()
                    .partition(|c| waits_on(c));
                debug!(
                    "Foreign key cycle through '{}': deferring {} constraint(s)",
                    name,
                    split.len()
                );
                if let Some(table) = pending.get_mut(name.as_str()) {
                    table.constraints = kept;
                }
                deferred.extend(split.into_iter().map(|constraint| Operation::AddConstraint {
                    table: name.clone(),
                    constraint,
                }));
            }
        }
    }

    (ordered, deferred)
}

/// Alphabetically first table on the cycle reached by walking unmet
/// dependencies from the first pending table
fn cycle_member(pending: &BTreeMap<&str, TableSchema>) -> Option<String> {
    let mut path: Vec<&str> = Vec::new();
    let mut current: &str = pending.keys().next()?;
    loop {
        if let Some(start) = path.iter().position(|n| *n == current) {
            return path[start..].iter().min().map(|n| n.to_string());
        }
        path.push(current);
        let table = pending.get(current)?;
        current = unmet_dependencies(current, table, pending).into_iter().min()?;
    }
}

fn unmet_dependencies<'a>(
    name: &str,
    table: &'a TableSchema,
    pending: &BTreeMap<&str, TableSchema>,
) -> Vec<&'a str> {
    table
        .foreign_keys()
        .filter_map(|fk| fk.references())
        .filter(|r| *r != name && pending.contains_key(r))
        .collect()
}

/// Dropped tables ordered dependents first. Cycles among dropped tables are
/// broken by dropping the first table's foreign keys beforehand.
fn drop_order(tables: &BTreeMap<&str, &TableSchema>) -> (Vec<Operation>, Vec<Operation>) {
    let mut pending: BTreeMap<&str, TableSchema> =
        tables.iter().map(|(name, t)| (*name, (*t).clone())).collect();
    let mut drops = Vec::new();
    let mut breaks = Vec::new();

    while !pending.is_empty() {
        // A table can go once no other pending table references it
        let free = pending
            .keys()
            .copied()
            .find(|name| {
                !pending.iter().any(|(other, t)| {
                    other != name && t.foreign_keys().any(|fk| fk.references() == Some(*name))
                })
            });

        match free {
            Some(name) => {
                if let Some(table) = pending.remove(name) {
                    drops.push(Operation::DropTable { table });
                }
            }
            None => {
                let Some((&name, _)) = pending.iter().next() else {
                    break;
                };
                if let Some(table) = pending.get_mut(name) {
                    let (split, kept): (Vec<NamedConstraint>, Vec<NamedConstraint>) = table
                        .constraints
                        .drain(..)
                        .partition(|c| c.references().is_some_and(|r| r != name));
                    table.constraints = kept;
                    breaks.extend(split.into_iter().map(|constraint| Operation::DropConstraint {
                        table: name.to_string(),
                        constraint,
                    }));
                }
            }
        }
    }

    (drops, breaks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::snapshot::ColumnSchema;
    use crate::schema::{FieldType, OnDelete};

    fn table(name: &str, refs: &[&str]) -> TableSchema {
        let mut t = TableSchema::new(name)
            .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key());
        for r in refs {
            let column = format!("{}_id", r);
            t.columns
                .push(ColumnSchema::new(column.clone(), FieldType::BigInteger).nullable());
            t.constraints.push(NamedConstraint::foreign_key(
                name,
                &column,
                r,
                "id",
                OnDelete::Cascade,
            ));
        }
        t
    }

    fn snapshot(tables: Vec<TableSchema>) -> SchemaSnapshot {
        let mut s = SchemaSnapshot::new();
        // Create every table bare, then attach constraints, so cycles are allowed
        for t in &tables {
            let mut bare = t.clone();
            bare.constraints.clear();
            s.apply(&Operation::CreateTable { table: bare }).unwrap();
        }
        for t in tables {
            for c in t.constraints {
                s.apply(&Operation::AddConstraint { table: t.name.clone(), constraint: c })
                    .unwrap();
            }
        }
        s
    }

    fn created(ops: &[Operation]) -> Vec<&str> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::CreateTable { table } => Some(table.name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_creates_in_dependency_order() {
        let target = snapshot(vec![
            table("users", &[]),
            table("tags", &[]),
            table("posts", &["users"]),
            table("comments", &["posts", "users"]),
        ]);
        let ops = diff(&target, &SchemaSnapshot::new()).unwrap();
        assert_eq!(created(&ops), vec!["tags", "users", "posts", "comments"]);
    }

    #[test]
    fn test_cycle_defers_foreign_keys() {
        let target = snapshot(vec![table("a", &["b"]), table("b", &["a"])]);
        let ops = diff(&target, &SchemaSnapshot::new()).unwrap();
        assert_eq!(created(&ops), vec!["a", "b"]);
        match &ops[2] {
            Operation::AddConstraint { table, constraint } => {
                assert_eq!(table, "a");
                assert_eq!(constraint.name, "fk_a_b_id");
            }
            other => panic!("expected deferred constraint, got {:?}", other),
        }

        let mut replayed = SchemaSnapshot::new();
        for op in &ops {
            replayed.apply(op).unwrap();
        }
        assert_eq!(replayed, target);
    }

    #[test]
    fn test_alter_ordering_and_drops() {
        let current = snapshot(vec![table("users", &[]), table("posts", &["users"])]);
        let mut users = table("users", &[]);
        users
            .columns
            .push(ColumnSchema::new("email", FieldType::Text).nullable());
        users.constraints.push(NamedConstraint::unique("users", vec!["email".into()]));
        let target = snapshot(vec![users]);

        let ops = diff(&target, &current).unwrap();
        let kinds: Vec<String> = ops.iter().map(|op| op.label()).collect();
        assert_eq!(
            kinds,
            vec!["add_email_to_users", "add_uq_users_email", "drop_posts_table"]
        );

        let mut replayed = current.clone();
        for op in &ops {
            replayed.apply(op).unwrap();
        }
        assert_eq!(replayed, target);
        assert!(diff(&target, &replayed).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_defers_only_cycle_members() {
        let target = snapshot(vec![table("a", &["b"]), table("b", &["c"]), table("c", &["b"])]);
        let ops = diff(&target, &SchemaSnapshot::new()).unwrap();
        let deferred: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::AddConstraint { constraint, .. } => Some(constraint.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deferred, vec!["fk_b_c_id"]);
        assert_eq!(created(&ops), vec!["b", "a", "c"]);

        let mut replayed = SchemaSnapshot::new();
        for op in &ops {
            replayed.apply(op).unwrap();
        }
        assert_eq!(replayed, target);
    }

    #[test]
    fn test_redefined_constraint_drops_before_add() {
        let current = snapshot(vec![table("users", &[]), table("posts", &["users"])]);
        let mut posts = table("posts", &[]);
        posts
            .columns
            .push(ColumnSchema::new("users_id", FieldType::BigInteger).nullable());
        posts.constraints.push(NamedConstraint::foreign_key(
            "posts",
            "users_id",
            "users",
            "id",
            OnDelete::Restrict,
        ));
        let target = snapshot(vec![table("users", &[]), posts]);

        let ops = diff(&target, &current).unwrap();
        let kinds: Vec<String> = ops.iter().map(|op| op.label()).collect();
        assert_eq!(kinds, vec!["drop_fk_posts_users_id", "add_fk_posts_users_id"]);

        let mut replayed = current.clone();
        for op in &ops {
            replayed.apply(op).unwrap();
        }
        assert_eq!(replayed, target);
        assert!(diff(&target, &replayed).unwrap().is_empty());
    }

    #[test]
    fn test_changed_column_is_conflict() {
        let current = snapshot(vec![table("users", &[])]);
        let mut users = table("users", &[]);
        users.columns[0].field_type = FieldType::Integer;
        let target = snapshot(vec![users]);
        assert!(matches!(diff(&target, &current), Err(OrmError::MigrationConflict(_))));
    }

    #[test]
    fn test_drop_cycle_breaks_constraints_first() {
        let current = snapshot(vec![table("a", &["b"]), table("b", &["a"])]);
        let ops = diff(&SchemaSnapshot::new(), &current).unwrap();
        let mut replayed = current.clone();
        for op in &ops {
            replayed.apply(op).unwrap();
        }
        assert!(replayed.is_empty());
    }
}
