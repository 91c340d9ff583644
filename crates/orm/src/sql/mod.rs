//! SQL Generation
//!
//! PostgreSQL rendering of statements and schema operations. Values are
//! always bound as `$n` parameters except `NULL`, which is written inline.

pub mod ddl;
pub mod render;

pub use ddl::render_operation;
pub use render::{render_statement, RenderedSql};

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
