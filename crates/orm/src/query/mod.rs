//! Query Builder Module - immutable, composable query sets
//!
//! `Q` trees are resolved into `Predicate`s against the model when they are
//! added to a `QuerySet`, so invalid lookups fail before anything runs.

pub mod builder;
pub mod changes;
pub mod condition;
pub mod dml;
pub mod execution;
pub mod lookup;
pub mod ordering;
pub mod pagination;
pub mod predicate;

pub use builder::QuerySet;
pub use changes::Changes;
pub use condition::Q;
pub use lookup::Lookup;
pub use ordering::OrderTerm;
pub use pagination::Page;
pub use predicate::Predicate;
