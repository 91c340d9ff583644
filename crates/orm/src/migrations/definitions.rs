//! Migration Definitions - migrations, applied records and the history
//!
//! A `MigrationHistory` is the ordered list of migration artifacts. Its
//! replay is the schema the store holds once every migration is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::diff::diff;
use super::operation::Operation;
use super::snapshot::SchemaSnapshot;
use crate::error::{OrmError, OrmResult};
use crate::schema::SchemaRegistry;

/// Represents a database migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Monotonically increasing identifier
    pub id: u32,
    /// Label derived from the first operation, e.g. `create_users_table`
    pub label: String,
    pub operations: Vec<Operation>,
    pub created_at: DateTime<Utc>,
}

impl Migration {
    pub fn new(id: u32, operations: Vec<Operation>) -> Self {
        let label = operations
            .first()
            .map(Operation::label)
            .unwrap_or_else(|| "empty".to_string());
        Self {
            id,
            label,
            operations,
            created_at: Utc::now(),
        }
    }

    /// `0001_create_users_table`
    pub fn name(&self) -> String {
        format!("{:04}_{}", self.id, self.label)
    }

    /// Operations undoing this migration, last operation first
    pub fn reverse_operations(&self) -> Vec<Operation> {
        self.operations.iter().rev().map(Operation::reverse).collect()
    }
}

/// Row of the history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: u32,
    pub applied_at: DateTime<Utc>,
}

/// Applied state of one migration
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStatus {
    Pending,
    Applied { applied_at: DateTime<Utc> },
}

/// Ordered migration history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationHistory {
    migrations: Vec<Migration>,
}

impl MigrationHistory {
    /// Sort by id; duplicate ids are a conflict
    pub fn new(mut migrations: Vec<Migration>) -> OrmResult<Self> {
        migrations.sort_by_key(|m| m.id);
        if let Some(pair) = migrations.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(OrmError::MigrationConflict(format!(
                "duplicate migration id {:04} ({} and {})",
                pair[0].id,
                pair[0].name(),
                pair[1].name()
            )));
        }
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn get(&self, id: u32) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == id)
    }

    pub fn latest_id(&self) -> Option<u32> {
        self.migrations.last().map(|m| m.id)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Re-execute every migration, in id order, against an empty snapshot
    pub fn replay(&self) -> OrmResult<SchemaSnapshot> {
        let mut snapshot = SchemaSnapshot::new();
        for migration in &self.migrations {
            for operation in &migration.operations {
                snapshot.apply(operation).map_err(|e| match e {
                    OrmError::MigrationConflict(reason) => OrmError::MigrationConflict(format!(
                        "replaying {}: {}",
                        migration.name(),
                        reason
                    )),
                    other => other,
                })?;
            }
        }
        Ok(snapshot)
    }

    /// Next migration for `operations`, or `None` when there is nothing to do
    pub fn generate(&self, operations: Vec<Operation>) -> Option<Migration> {
        if operations.is_empty() {
            return None;
        }
        let id = self.latest_id().map_or(1, |id| id + 1);
        Some(Migration::new(id, operations))
    }

    /// Append a migration; its id must follow every existing id
    pub fn push(&mut self, migration: Migration) -> OrmResult<()> {
        if let Some(latest) = self.latest_id() {
            if migration.id <= latest {
                return Err(OrmError::MigrationConflict(format!(
                    "migration {} does not follow {:04}",
                    migration.name(),
                    latest
                )));
            }
        }
        self.migrations.push(migration);
        Ok(())
    }

    /// Extract the registry's schema, diff it against the replayed history
    /// and wrap the difference as the next migration
    pub fn make_migration(&self, registry: &SchemaRegistry) -> OrmResult<Option<Migration>> {
        let target = SchemaSnapshot::extract(registry)?;
        let current = self.replay()?;
        let operations = diff(&target, &current)?;
        let migration = self.generate(operations);
        match &migration {
            Some(m) => debug!("Generated migration {} ({} operations)", m.name(), m.operations.len()),
            None => debug!("Schema is up to date; no migration generated"),
        }
        Ok(migration)
    }
}
