//! Schema Registry - validated model descriptors and relationship resolution
//!
//! Registration validates each descriptor on its own. `finalize` runs once
//! every descriptor is known and resolves the symbolic relationship targets;
//! after that the registry is read-only and hands out `Arc<ResolvedModel>`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::field::FieldDescriptor;
use super::model::{ConstraintDescriptor, ModelDescriptor, OnDelete, RelationshipKind};
use crate::error::{OrmError, OrmResult};
use crate::model::Model;

/// A foreign key with its target resolved to a table and column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForeignKey {
    pub column: String,
    pub target_model: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: OnDelete,
}

/// How parent rows and related rows line up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipPath {
    /// `related.target_column = parent.local_column`
    ToOne {
        local_column: String,
        target_column: String,
    },
    /// `related.target_column = parent.local_column`, many rows per parent
    Reverse {
        local_column: String,
        target_column: String,
    },
    /// Parent and related rows linked by junction rows
    Through {
        junction_table: String,
        junction_key: String,
        /// Junction column referencing the parent
        source_column: String,
        /// Junction column referencing the related row
        target_column: String,
        local_column: String,
        target_key: String,
    },
}

/// Relationship with every symbolic reference resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelationship {
    pub name: String,
    pub kind: RelationshipKind,
    pub target_model: String,
    pub target_table: String,
    pub path: RelationshipPath,
}

/// Finalized, immutable model metadata
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    descriptor: ModelDescriptor,
    primary_key: usize,
    foreign_keys: Vec<ResolvedForeignKey>,
    relationships: Vec<ResolvedRelationship>,
}

impl ResolvedModel {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn table(&self) -> &str {
        &self.descriptor.table
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.descriptor.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.descriptor.get_field(name)
    }

    pub fn primary_key(&self) -> &FieldDescriptor {
        &self.descriptor.fields[self.primary_key]
    }

    pub fn pk_column(&self) -> &str {
        &self.primary_key().name
    }

    /// Field addressed by a field name or a to-one relationship name
    pub fn resolve_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.descriptor
            .column_for(name)
            .and_then(|column| self.descriptor.get_field(column))
    }

    pub fn relationship(&self, name: &str) -> Option<&ResolvedRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn relationships(&self) -> &[ResolvedRelationship] {
        &self.relationships
    }

    pub fn foreign_keys(&self) -> &[ResolvedForeignKey] {
        &self.foreign_keys
    }

    pub fn constraints(&self) -> &[ConstraintDescriptor] {
        &self.descriptor.constraints
    }
}

/// Registry of model descriptors
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    descriptors: BTreeMap<String, ModelDescriptor>,
    resolved: Option<BTreeMap<String, Arc<ResolvedModel>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a descriptor
    pub fn register(&mut self, descriptor: ModelDescriptor) -> OrmResult<()> {
        if self.resolved.is_some() {
            return Err(OrmError::Schema(format!(
                "cannot register '{}': registry is already finalized",
                descriptor.name
            )));
        }
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(OrmError::Schema(format!(
                "model '{}' is already registered",
                descriptor.name
            )));
        }
        if let Some(existing) = self.descriptors.values().find(|d| d.table == descriptor.table) {
            return Err(OrmError::Schema(format!(
                "duplicate table name '{}' (models '{}' and '{}')",
                descriptor.table, existing.name, descriptor.name
            )));
        }

        let descriptor = normalize(descriptor)?;
        debug!("Registered model {} (table {})", descriptor.name, descriptor.table);
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Register a typed model's descriptor
    pub fn register_model<M: Model>(&mut self) -> OrmResult<()> {
        self.register(M::descriptor())
    }

    /// Register every descriptor from a list of declaration sources
    pub fn register_all<S, I>(&mut self, sources: S) -> OrmResult<()>
    where
        S: IntoIterator<Item = I>,
        I: IntoIterator<Item = ModelDescriptor>,
    {
        for source in sources {
            for descriptor in source {
                self.register(descriptor)?;
            }
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.resolved.is_some()
    }

    /// Resolve every symbolic relationship target.
    ///
    /// Either every model resolves or the registry stays unfinalized.
    pub fn finalize(&mut self) -> OrmResult<()> {
        if self.resolved.is_some() {
            return Ok(());
        }

        let mut resolved = BTreeMap::new();
        for descriptor in self.descriptors.values() {
            let model = self.resolve(descriptor)?;
            resolved.insert(descriptor.name.clone(), Arc::new(model));
        }

        debug!("Schema registry finalized with {} models", resolved.len());
        self.resolved = Some(resolved);
        Ok(())
    }

    /// Fully-resolved model by name
    pub fn get(&self, name: &str) -> OrmResult<Arc<ResolvedModel>> {
        let resolved = self.finalized()?;
        resolved
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::Schema(format!("unknown model '{}'", name)))
    }

    /// Fully-resolved model by table name
    pub fn get_by_table(&self, table: &str) -> OrmResult<Arc<ResolvedModel>> {
        let resolved = self.finalized()?;
        resolved
            .values()
            .find(|m| m.table() == table)
            .cloned()
            .ok_or_else(|| OrmError::Schema(format!("unknown table '{}'", table)))
    }

    /// All models, ordered by model name
    pub fn models(&self) -> OrmResult<Vec<Arc<ResolvedModel>>> {
        Ok(self.finalized()?.values().cloned().collect())
    }

    fn finalized(&self) -> OrmResult<&BTreeMap<String, Arc<ResolvedModel>>> {
        self.resolved
            .as_ref()
            .ok_or_else(|| OrmError::Schema("schema registry is not finalized".to_string()))
    }

    fn descriptor(&self, name: &str, referenced_by: &str) -> OrmResult<&ModelDescriptor> {
        self.descriptors.get(name).ok_or_else(|| {
            OrmError::Schema(format!("{} references unknown model '{}'", referenced_by, name))
        })
    }

    fn resolve(&self, descriptor: &ModelDescriptor) -> OrmResult<ResolvedModel> {
        let primary_key = descriptor
            .fields
            .iter()
            .position(|f| f.primary_key)
            .ok_or_else(|| OrmError::Schema(format!("model '{}' has no primary key", descriptor.name)))?;

        let mut foreign_keys = Vec::new();
        for constraint in &descriptor.constraints {
            if let ConstraintDescriptor::ForeignKey { column, target, on_delete } = constraint {
                let origin = format!("foreign key {}.{}", descriptor.table, column);
                let target_descriptor = self.descriptor(target, &origin)?;
                let target_pk = target_descriptor.primary_key().ok_or_else(|| {
                    OrmError::Schema(format!("{} targets model '{}' without primary key", origin, target))
                })?;
                let local = descriptor.get_field(column).ok_or_else(|| {
                    OrmError::Schema(format!("{}: unknown column", origin))
                })?;
                if !local.field_type.can_reference(target_pk.field_type) {
                    return Err(OrmError::Schema(format!(
                        "{} has type {:?} but {}.{} is {:?}",
                        origin, local.field_type, target_descriptor.table, target_pk.name, target_pk.field_type
                    )));
                }
                foreign_keys.push(ResolvedForeignKey {
                    column: column.clone(),
                    target_model: target.clone(),
                    target_table: target_descriptor.table.clone(),
                    target_column: target_pk.name.clone(),
                    on_delete: *on_delete,
                });
            }
        }

        let local_pk = descriptor.fields[primary_key].name.clone();
        let mut relationships = Vec::new();
        for relationship in &descriptor.relationships {
            let origin = format!("relationship {}.{}", descriptor.name, relationship.name);
            let target = self.descriptor(&relationship.target, &origin)?;
            let path = match relationship.kind {
                RelationshipKind::ToOne => {
                    let column = relationship.column.clone().unwrap_or_default();
                    let fk = foreign_keys.iter().find(|fk| fk.column == column).ok_or_else(|| {
                        OrmError::Schema(format!("{} has no foreign key on '{}'", origin, column))
                    })?;
                    RelationshipPath::ToOne {
                        local_column: column,
                        target_column: fk.target_column.clone(),
                    }
                }
                RelationshipKind::ToManyReverse => {
                    let via = relationship.via.as_deref().unwrap_or_default();
                    let back = target
                        .get_relationship(via)
                        .filter(|r| r.kind == RelationshipKind::ToOne && r.target == descriptor.name)
                        .ok_or_else(|| {
                            OrmError::Schema(format!(
                                "{}: model '{}' has no to-one relationship '{}' pointing to '{}'",
                                origin, target.name, via, descriptor.name
                            ))
                        })?;
                    RelationshipPath::Reverse {
                        local_column: local_pk.clone(),
                        target_column: back.column.clone().unwrap_or_default(),
                    }
                }
                RelationshipKind::ManyToMany => {
                    let through = relationship.through.as_deref().unwrap_or_default();
                    let junction = self.descriptor(through, &origin)?;
                    self.junction_path(descriptor, target, junction, &local_pk, &origin)?
                }
            };
            relationships.push(ResolvedRelationship {
                name: relationship.name.clone(),
                kind: relationship.kind,
                target_model: target.name.clone(),
                target_table: target.table.clone(),
                path,
            });
        }

        Ok(ResolvedModel {
            descriptor: descriptor.clone(),
            primary_key,
            foreign_keys,
            relationships,
        })
    }

    /// A junction must expose exactly two foreign keys, one per endpoint
    fn junction_path(
        &self,
        source: &ModelDescriptor,
        target: &ModelDescriptor,
        junction: &ModelDescriptor,
        local_pk: &str,
        origin: &str,
    ) -> OrmResult<RelationshipPath> {
        let fks: Vec<(&String, &String)> = junction
            .constraints
            .iter()
            .filter_map(|c| match c {
                ConstraintDescriptor::ForeignKey { column, target, .. } => Some((column, target)),
                _ => None,
            })
            .collect();
        if fks.len() != 2 {
            return Err(OrmError::Schema(format!(
                "{}: junction model '{}' must have exactly two foreign keys, found {}",
                origin,
                junction.name,
                fks.len()
            )));
        }

        let (source_fk, target_fk) = if *fks[0].1 == source.name && *fks[1].1 == target.name {
            (fks[0], fks[1])
        } else if *fks[1].1 == source.name && *fks[0].1 == target.name {
            (fks[1], fks[0])
        } else {
            return Err(OrmError::Schema(format!(
                "{}: junction model '{}' must reference '{}' and '{}', found '{}' and '{}'",
                origin, junction.name, source.name, target.name, fks[0].1, fks[1].1
            )));
        };

        let junction_key = junction
            .primary_key()
            .map(|f| f.name.clone())
            .ok_or_else(|| OrmError::Schema(format!("junction model '{}' has no primary key", junction.name)))?;
        let target_key = target
            .primary_key()
            .map(|f| f.name.clone())
            .ok_or_else(|| OrmError::Schema(format!("model '{}' has no primary key", target.name)))?;

        Ok(RelationshipPath::Through {
            junction_table: junction.table.clone(),
            junction_key,
            source_column: source_fk.0.clone(),
            target_column: target_fk.0.clone(),
            local_column: local_pk.to_string(),
            target_key,
        })
    }
}

/// Structural checks that need no other model, plus resolution of
/// relationship names used in unique-together constraints.
fn normalize(mut descriptor: ModelDescriptor) -> OrmResult<ModelDescriptor> {
    let name = descriptor.name.clone();
    if name.is_empty() || descriptor.table.is_empty() {
        return Err(OrmError::Schema("model and table names must not be empty".to_string()));
    }

    let mut seen = HashSet::new();
    for field in &descriptor.fields {
        if field.name.is_empty() || field.name.contains("__") {
            return Err(OrmError::Schema(format!(
                "model '{}': invalid field name '{}'",
                name, field.name
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(OrmError::Schema(format!(
                "model '{}': duplicate field '{}'",
                name, field.name
            )));
        }
    }

    let pk_count = descriptor.fields.iter().filter(|f| f.primary_key).count();
    if pk_count != 1 {
        return Err(OrmError::Schema(format!(
            "model '{}' must declare exactly one primary key, found {}",
            name, pk_count
        )));
    }

    let mut relationship_names = HashSet::new();
    for relationship in &descriptor.relationships {
        if !relationship_names.insert(relationship.name.as_str()) {
            return Err(OrmError::Schema(format!(
                "model '{}': duplicate relationship '{}'",
                name, relationship.name
            )));
        }
        if descriptor.get_field(&relationship.name).is_some() {
            return Err(OrmError::Schema(format!(
                "model '{}': relationship '{}' shadows a field",
                name, relationship.name
            )));
        }
        let complete = match relationship.kind {
            RelationshipKind::ToOne => relationship
                .column
                .as_deref()
                .is_some_and(|c| descriptor.get_field(c).is_some()),
            RelationshipKind::ToManyReverse => relationship.via.is_some(),
            RelationshipKind::ManyToMany => relationship.through.is_some(),
        };
        if !complete {
            return Err(OrmError::Schema(format!(
                "model '{}': relationship '{}' is incomplete",
                name, relationship.name
            )));
        }
    }

    let mut constraints = Vec::with_capacity(descriptor.constraints.len());
    for constraint in &descriptor.constraints {
        let normalized = match constraint {
            ConstraintDescriptor::Unique { field } => {
                let column = descriptor.column_for(field).ok_or_else(|| {
                    OrmError::Schema(format!("model '{}': unique on unknown field '{}'", name, field))
                })?;
                ConstraintDescriptor::Unique { field: column.to_string() }
            }
            ConstraintDescriptor::UniqueTogether { fields } => {
                if fields.len() < 2 {
                    return Err(OrmError::Schema(format!(
                        "model '{}': unique-together needs at least two fields",
                        name
                    )));
                }
                let columns = fields
                    .iter()
                    .map(|f| {
                        descriptor.column_for(f).map(str::to_string).ok_or_else(|| {
                            OrmError::Schema(format!(
                                "model '{}': unique-together on unknown field '{}'",
                                name, f
                            ))
                        })
                    })
                    .collect::<OrmResult<Vec<_>>>()?;
                ConstraintDescriptor::UniqueTogether { fields: columns }
            }
            ConstraintDescriptor::ForeignKey { column, .. } => {
                if descriptor.get_field(column).is_none() {
                    return Err(OrmError::Schema(format!(
                        "model '{}': foreign key on unknown column '{}'",
                        name, column
                    )));
                }
                constraint.clone()
            }
        };
        if !constraints.contains(&normalized) {
            constraints.push(normalized);
        }
    }
    descriptor.constraints = constraints;
    Ok(descriptor)
}
