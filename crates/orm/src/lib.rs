//! # strata-orm: declarative data-mapping engine
//!
//! Model descriptors are collected in a [`SchemaRegistry`]; migrations are
//! generated by diffing the registry against the replayed migration
//! history; [`QuerySet`]s compose filters, ordering, joins and prefetches;
//! [`Session::atomic`] scopes all-or-nothing units of work with savepoint
//! nesting.
//!
//! Two stores are provided: PostgreSQL through sqlx and an in-process
//! reference store selected with a `memory://` URL.

pub mod backends;
pub mod config;
pub mod connection;
pub mod error;
pub mod migrations;
pub mod model;
pub mod query;
pub mod relationships;
pub mod schema;
pub mod sql;
pub mod transaction;
pub mod value;

pub use backends::{DatabaseBackend, DatabaseConnection, MemoryBackend, PostgresBackend};
pub use config::{BackendKind, DatabaseConfig};
pub use connection::{ConnectionPool, PoolStats};
pub use error::{ConstraintKind, OrmError, OrmResult};
pub use migrations::{
    Migration, MigrationHistory, MigrationRunResult, MigrationRunner, MigrationStatus,
    MigrationStore, Operation, SchemaSnapshot,
};
pub use model::Model;
pub use query::{Changes, Lookup, OrderTerm, Page, QuerySet, Q};
pub use relationships::{BatchConfig, Instance};
pub use schema::{
    FieldDescriptor, FieldType, ModelDescriptor, OnDelete, RelationshipKind, ResolvedModel,
    SchemaRegistry,
};
pub use transaction::{AtomicToken, IsolationLevel, Session, TransactionConfig};
pub use value::{Row, Value};
