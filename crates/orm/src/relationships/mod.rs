//! Relationship loading
//!
//! To-one relationships are joined into the base query; collections are
//! prefetched in batches after the base rows are read.

pub mod instance;
pub mod loader;

pub use instance::{Instance, Related};
pub use loader::BatchConfig;
