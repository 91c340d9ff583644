//! Query Builder pagination operations

use serde::Serialize;

use super::builder::QuerySet;
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::relationships::Instance;
use crate::transaction::Session;

/// One page of results
#[derive(Debug, Serialize)]
pub struct Page<M> {
    pub items: Vec<Instance<M>>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub pages: u64,
}

impl<M> Page<M> {
    pub fn has_next(&self) -> bool {
        self.page < self.pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }
}

impl<M> QuerySet<M> {
    /// Add LIMIT clause
    pub fn limit(&self, count: u64) -> Self {
        let mut next = self.clone();
        next.limit = Some(count);
        next
    }

    /// Limit of at most `count`, keeping any smaller limit already set
    pub(crate) fn limit_at_most(&self, count: u64) -> Self {
        self.limit(self.limit.map_or(count, |l| l.min(count)))
    }

    /// Add OFFSET clause
    pub fn offset(&self, count: u64) -> Self {
        let mut next = self.clone();
        next.offset = Some(count);
        next
    }
}

impl<M: Model> QuerySet<M> {
    /// Page `page` (1-based) of `per_page` items, with the total count
    pub async fn paginate(&self, session: &mut Session, page: u64, per_page: u64) -> OrmResult<Page<M>> {
        if page == 0 || per_page == 0 {
            return Err(OrmError::Query(format!(
                "page and per_page must be at least 1 (got page={}, per_page={})",
                page, per_page
            )));
        }
        let total = self.count(session).await?;
        let items = self
            .offset((page - 1).saturating_mul(per_page))
            .limit(per_page)
            .all(session)
            .await?;
        Ok(Page {
            items,
            total,
            page,
            per_page,
            pages: total.div_ceil(per_page),
        })
    }
}
