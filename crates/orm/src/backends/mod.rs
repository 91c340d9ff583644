//! Database Backends
//!
//! Backend traits plus the two stores: an in-process reference store and
//! PostgreSQL through sqlx.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::*;
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
