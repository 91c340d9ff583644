//! On-disk migration artifacts
//!
//! One JSON file per migration, named `NNNN_<label>.json`. Artifacts are
//! immutable: writing over an existing file is refused.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::definitions::{Migration, MigrationHistory};
use crate::error::{OrmError, OrmResult};
use crate::schema::SchemaRegistry;

#[derive(Debug, Clone)]
pub struct MigrationStore {
    dir: PathBuf,
}

impl MigrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, migration: &Migration) -> PathBuf {
        self.dir.join(format!("{}.json", migration.name()))
    }

    /// Write a new artifact
    pub fn write(&self, migration: &Migration) -> OrmResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(migration);
        let json = serde_json::to_string_pretty(migration)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    OrmError::MigrationConflict(format!(
                        "migration artifact {} already exists",
                        path.display()
                    ))
                } else {
                    OrmError::from(e)
                }
            })?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;

        info!("Created migration: {}", path.display());
        Ok(path)
    }

    /// Load every artifact, sorted by id. A missing directory is an empty history.
    pub fn load(&self) -> OrmResult<MigrationHistory> {
        if !self.dir.exists() {
            return Ok(MigrationHistory::default());
        }

        let mut migrations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let migration: Migration = serde_json::from_str(&content).map_err(|e| {
                OrmError::Serialization(format!("{}: {}", path.display(), e))
            })?;

            let expected = format!("{}.json", migration.name());
            if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                return Err(OrmError::MigrationConflict(format!(
                    "artifact {} holds migration {}",
                    path.display(),
                    migration.name()
                )));
            }
            debug!("Loaded migration {}", migration.name());
            migrations.push(migration);
        }

        MigrationHistory::new(migrations)
    }

    /// Diff the registry against the stored history and write the next
    /// artifact, if any
    pub fn make_migrations(&self, registry: &SchemaRegistry) -> OrmResult<Option<Migration>> {
        let history = self.load()?;
        let Some(migration) = history.make_migration(registry)? else {
            return Ok(None);
        };
        self.write(&migration)?;
        Ok(Some(migration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::operation::Operation;
    use crate::migrations::snapshot::{ColumnSchema, TableSchema};
    use crate::schema::FieldType;
    use tempfile::TempDir;

    fn migration(id: u32, table: &str) -> Migration {
        Migration::new(
            id,
            vec![Operation::CreateTable {
                table: TableSchema::new(table)
                    .column(ColumnSchema::new("id", FieldType::BigInteger).primary_key()),
            }],
        )
    }

    #[test]
    fn test_write_then_load_sorted() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path().join("migrations"));
        store.write(&migration(2, "posts")).unwrap();
        let path = store.write(&migration(1, "users")).unwrap();
        assert!(path.ends_with("0001_create_users_table.json"));

        let history = store.load().unwrap();
        let ids: Vec<u32> = history.migrations().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            history.migrations()[0].operations,
            migration(1, "users").operations
        );
    }

    #[test]
    fn test_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path());
        store.write(&migration(1, "users")).unwrap();
        let err = store.write(&migration(1, "users")).unwrap_err();
        assert!(matches!(err, OrmError::MigrationConflict(_)));
    }

    #[test]
    fn test_missing_dir_is_empty_history() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path().join("nope"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_make_migrations_is_idempotent() {
        use crate::schema::{FieldDescriptor, ModelDescriptor};

        let mut registry = SchemaRegistry::new();
        registry
            .register(
                ModelDescriptor::new("Tag", "tags")
                    .field(FieldDescriptor::id())
                    .field(FieldDescriptor::text("name").unique()),
            )
            .unwrap();
        registry.finalize().unwrap();

        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path());
        let first = store.make_migrations(&registry).unwrap().unwrap();
        assert_eq!(first.name(), "0001_create_tags_table");
        assert!(store.make_migrations(&registry).unwrap().is_none());
    }
}
