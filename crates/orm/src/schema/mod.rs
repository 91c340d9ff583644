//! Schema declaration and registry
//!
//! Models are declared with `ModelDescriptor` builders, collected in a
//! `SchemaRegistry` and finalized once every target model is known.

pub mod field;
pub mod model;
pub mod registry;

pub use field::{FieldDescriptor, FieldType};
pub use model::{
    ConstraintDescriptor, ModelDescriptor, OnDelete, RelationshipDescriptor, RelationshipKind,
};
pub use registry::{
    RelationshipPath, ResolvedForeignKey, ResolvedModel, ResolvedRelationship, SchemaRegistry,
};
