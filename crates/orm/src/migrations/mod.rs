//! Migration System
//!
//! Schema snapshots extracted from the registry are diffed against the
//! replayed migration history; the difference becomes the next migration
//! artifact. The runner applies pending artifacts to a store.

pub mod definitions;
pub mod diff;
pub mod operation;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use definitions::{Migration, MigrationHistory, MigrationRecord, MigrationStatus};
pub use diff::diff;
pub use operation::Operation;
pub use runner::{pending_migrations, MigrationRunResult, MigrationRunner};
pub use snapshot::{ColumnSchema, ConstraintSchema, NamedConstraint, SchemaSnapshot, TableSchema};
pub use store::MigrationStore;
