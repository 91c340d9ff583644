//! QuerySet - immutable query descriptor
//!
//! Every builder call validates its input against the model and returns a
//! new value; the receiver is never modified. Parts a call leaves alone are
//! shared with the receiver. Execution methods live in
//! `execution` and `dml`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::condition::Q;
use super::ordering::OrderTerm;
use super::predicate::Predicate;
use crate::backends::{JoinSpec, SelectColumn, SelectStatement};
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::schema::{RelationshipKind, RelationshipPath, ResolvedModel, SchemaRegistry};

/// Query over the rows of model `M`
pub struct QuerySet<M> {
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) model: Arc<ResolvedModel>,
    pub(crate) predicate: Option<Arc<Predicate>>,
    pub(crate) joins: Arc<[String]>,
    pub(crate) prefetches: Arc<[String]>,
    pub(crate) ordering: Arc<[OrderTerm]>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for QuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            model: Arc::clone(&self.model),
            predicate: self.predicate.clone(),
            joins: Arc::clone(&self.joins),
            prefetches: Arc::clone(&self.prefetches),
            ordering: Arc::clone(&self.ordering),
            limit: self.limit,
            offset: self.offset,
            _marker: PhantomData,
        }
    }
}

impl<M> fmt::Debug for QuerySet<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model.name())
            .field("predicate", &self.predicate)
            .field("joins", &self.joins)
            .field("prefetches", &self.prefetches)
            .field("ordering", &self.ordering)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<M: Model> QuerySet<M> {
    /// Unfiltered query over `M`; the registry must be finalized
    pub fn new(registry: &Arc<SchemaRegistry>) -> OrmResult<Self> {
        let model = registry.get(M::NAME)?;
        Ok(Self {
            registry: Arc::clone(registry),
            model,
            predicate: None,
            joins: Vec::new().into(),
            prefetches: Vec::new().into(),
            ordering: Vec::new().into(),
            limit: None,
            offset: None,
            _marker: PhantomData,
        })
    }
}

impl<M> QuerySet<M> {
    pub fn model(&self) -> &Arc<ResolvedModel> {
        &self.model
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_deref()
    }

    pub fn joins(&self) -> &[String] {
        &self.joins
    }

    pub fn prefetches(&self) -> &[String] {
        &self.prefetches
    }

    /// AND `q` into the filter tree
    pub fn filter(&self, q: Q) -> OrmResult<Self> {
        let predicate = q.resolve(&self.model)?;
        Ok(self.with_predicate(predicate))
    }

    /// AND the negation of `q` into the filter tree
    pub fn exclude(&self, q: Q) -> OrmResult<Self> {
        let predicate = q.resolve(&self.model)?;
        Ok(self.with_predicate(predicate.negate()))
    }

    pub(crate) fn with_predicate(&self, predicate: Predicate) -> Self {
        let combined = match self.predicate.as_deref() {
            Some(existing) => existing.clone().and(predicate),
            None => predicate,
        };
        let mut next = self.clone();
        next.predicate = Some(Arc::new(combined));
        next
    }

    /// Load a to-one relationship in the same query
    pub fn join(&self, name: &str) -> OrmResult<Self> {
        let relationship = self.model.relationship(name).ok_or_else(|| {
            OrmError::Query(format!(
                "model '{}' has no relationship '{}'",
                self.model.name(),
                name
            ))
        })?;
        if relationship.kind != RelationshipKind::ToOne {
            return Err(OrmError::Relationship(format!(
                "cannot join collection relationship '{}.{}'; use prefetch",
                self.model.name(),
                name
            )));
        }
        let mut next = self.clone();
        if !self.joins.iter().any(|j| j == name) {
            next.joins = appended(&self.joins, name);
        }
        Ok(next)
    }

    /// Load a collection relationship with a batched second query
    pub fn prefetch(&self, name: &str) -> OrmResult<Self> {
        let relationship = self.model.relationship(name).ok_or_else(|| {
            OrmError::Query(format!(
                "model '{}' has no relationship '{}'",
                self.model.name(),
                name
            ))
        })?;
        if !relationship.kind.is_collection() {
            return Err(OrmError::Relationship(format!(
                "cannot prefetch to-one relationship '{}.{}'; use join",
                self.model.name(),
                name
            )));
        }
        let mut next = self.clone();
        if !self.prefetches.iter().any(|p| p == name) {
            next.prefetches = appended(&self.prefetches, name);
        }
        Ok(next)
    }

    /// Row statement for the current descriptor, joins included
    pub(crate) fn select_statement(&self) -> OrmResult<SelectStatement> {
        let mut select = SelectStatement::new(self.model.table(), columns_of(&self.model));
        for name in self.joins.iter() {
            select.joins.push(self.join_spec(name)?);
        }
        select.predicate = self.predicate.as_deref().cloned();
        select.order_by = self.effective_ordering();
        select.limit = self.limit;
        select.offset = self.offset;
        Ok(select)
    }

    fn join_spec(&self, name: &str) -> OrmResult<JoinSpec> {
        let relationship = self.model.relationship(name).ok_or_else(|| {
            OrmError::Relationship(format!("unknown relationship '{}'", name))
        })?;
        let RelationshipPath::ToOne {
            local_column,
            target_column,
        } = &relationship.path
        else {
            return Err(OrmError::Relationship(format!(
                "relationship '{}' is not to-one",
                name
            )));
        };
        let target = self.registry.get(&relationship.target_model)?;
        Ok(JoinSpec {
            alias: name.to_string(),
            table: target.table().to_string(),
            columns: columns_of(&target),
            local_column: local_column.clone(),
            target_column: target_column.clone(),
        })
    }
}

fn appended(names: &[String], name: &str) -> Arc<[String]> {
    names.iter().cloned().chain(std::iter::once(name.to_string())).collect()
}

/// Every declared column of `model`, in declaration order
pub(crate) fn columns_of(model: &ResolvedModel) -> Vec<SelectColumn> {
    model
        .fields()
        .iter()
        .map(|f| SelectColumn::new(f.name.clone(), f.field_type))
        .collect()
}
