//! ORDER BY terms

use super::builder::QuerySet;
use crate::error::{OrmError, OrmResult};
use crate::schema::ResolvedModel;

/// One sort key over a base-table column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
}

impl OrderTerm {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    /// Parse `-field` (descending), `+field` or `field` (ascending)
    pub fn parse(spec: &str, model: &ResolvedModel) -> OrmResult<Self> {
        let (name, descending) = match spec.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (spec.strip_prefix('+').unwrap_or(spec), false),
        };
        if name.is_empty() {
            return Err(OrmError::Query("empty ordering field".to_string()));
        }
        let field = model.resolve_field(name).ok_or_else(|| {
            OrmError::Query(format!(
                "cannot order '{}' by unknown field '{}'",
                model.name(),
                name
            ))
        })?;
        Ok(Self {
            column: field.name.clone(),
            descending,
        })
    }
}

impl<M> QuerySet<M> {
    /// Replace the ordering; `order_by(&["-created_at", "id"])`
    pub fn order_by(&self, fields: &[&str]) -> OrmResult<Self> {
        let terms = fields
            .iter()
            .map(|f| OrderTerm::parse(f, &self.model))
            .collect::<OrmResult<Vec<_>>>()?;
        let mut next = self.clone();
        next.ordering = terms.into();
        Ok(next)
    }

    pub fn ordering(&self) -> &[OrderTerm] {
        &self.ordering
    }

    /// Requested terms with the primary key as final tie-breaker
    pub(crate) fn effective_ordering(&self) -> Vec<OrderTerm> {
        let pk = self.model.pk_column();
        let mut terms = self.ordering.to_vec();
        if !terms.iter().any(|t| t.column == pk) {
            terms.push(OrderTerm::asc(pk));
        }
        terms
    }
}
