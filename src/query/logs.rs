use tracing::debug;

use crate::models::{AccountId, LabelMap, LogRecord, Page, TimeWindow};
use crate::store::{EventStore, Field, LogQuery, Predicate, QueryContext, Term};
use crate::window::Pagination;
use crate::Result;

use super::filter::FilterSet;

#[derive(Debug, Clone, PartialEq)]
pub struct LogSearch {
    pub account: AccountId,
    pub window: TimeWindow,
    pub service: Option<String>,
    pub severity: Option<String>,
    pub filters: LabelMap,
    pub pagination: Pagination,
}

impl LogSearch {
    pub fn new(account: AccountId, window: TimeWindow) -> Self {
        Self {
            account,
            window,
            service: None,
            severity: None,
            filters: LabelMap::new(),
            pagination: Pagination::default(),
        }
    }

    fn predicate(&self) -> Predicate {
        let mut predicate = Predicate::new(self.account.clone());
        if let Some(service) = &self.service {
            predicate = predicate.and(Term::Eq(Field::ServiceName, service.clone()));
        }
        if let Some(severity) = &self.severity {
            predicate = predicate.and(Term::Eq(Field::Severity, severity.trim().to_ascii_uppercase()));
        }
        predicate.and_all(FilterSet::new(&self.filters, &[]).terms())
    }
}

/// Newest first. `total_count` covers every match, not just this page.
pub async fn search_logs(
    store: &dyn EventStore,
    ctx: &QueryContext,
    search: &LogSearch,
) -> Result<Page<LogRecord>> {
    let query = LogQuery {
        predicate: search.predicate(),
        window: search.window,
        pagination: search.pagination,
    };
    let (items, total_count) = store.logs(ctx, &query).await?;
    debug!(account = %search.account, total_count, returned = items.len(), "Log search");

    Ok(Page {
        items,
        total_count,
        page: search.pagination.page,
        page_size: search.pagination.page_size,
    })
}
