pub mod filters;
pub mod presets;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

pub use self::filters::{
    DisplayMeta, FilterError, FilterNode, FilterParseError, FilterTree, GroupOp, NodeKind, ROOT,
};
use crate::{
    outbound::{QueryBody, RequestBody},
    resources::{Catalog, InvalidResourceIds, ResourceSelector},
    utils::json_hash,
};

/// What could not be applied from the last persisted request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsingError {
    pub resource_ids: Option<InvalidResourceIds>,
    pub query_body: Option<FilterParseError>,
}

impl ParsingError {
    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_none() && self.query_body.is_none()
    }
}

/// Free-text search, a filter tree and a resource scope.
#[derive(Debug, Clone)]
pub struct Query {
    pub search: Option<String>,
    pub filters: FilterTree,
    pub resources: ResourceSelector,
    pub after: Option<Value>,
    pub version: Option<Value>,
    pub parsing_error: ParsingError,
}

impl Query {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            search: None,
            filters: FilterTree::new(),
            resources: ResourceSelector::new(catalog),
            after: None,
            version: None,
            parsing_error: ParsingError::default(),
        }
    }

    pub fn query_body(&self, ignore_temp: bool) -> QueryBody {
        QueryBody {
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            filters: self.filters.to_filters(ignore_temp),
        }
    }

    pub fn request_body(&self, ignore_temp: bool) -> RequestBody {
        RequestBody {
            query: self.query_body(ignore_temp),
            resource_ids: self.resources.sorted(),
            after: self.after.clone(),
            version: self.version.clone(),
            size: None,
        }
    }

    /// Apply a persisted request body. Resource ids and filters are checked
    /// independently; whatever fails is recorded in `parsing_error` and the
    /// previous value is kept. The search text goes with the filters. Returns `true` when everything applied.
    pub fn set_request_body(&mut self, body: &RequestBody) -> bool {
        self.parsing_error = ParsingError::default();

        match self.resources.set(&body.resource_ids) {
            Ok(()) => {}
            Err(invalid) => {
                warn!("ignoring resource ids: {invalid}");
                self.parsing_error.resource_ids = Some(invalid);
            }
        }

        match FilterTree::parse(body.query.filters.as_ref()) {
            Ok(tree) => {
                self.filters = tree;
                self.search = body.query.search.clone();
            }
            Err(e) => {
                warn!("ignoring query: {e}");
                self.parsing_error.query_body = Some(e);
            }
        }

        self.after = body.after.clone();
        self.version = body.version.clone();
        debug!("applied request body, {} filter nodes", self.filters.count(false));
        self.parsing_error.is_empty()
    }

    /// Identity of the query for session tagging. Paging state is excluded.
    pub fn hash(&self) -> u64 {
        json_hash(&self.request_body(false).shareable())
    }

    pub fn reset(&mut self) {
        self.search = None;
        self.filters.reset();
        self.resources.clear();
        self.after = None;
        self.version = None;
        self.parsing_error = ParsingError::default();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::resources::tests::sample_catalog;

    fn query() -> Query {
        Query::new(Arc::new(sample_catalog()))
    }

    #[test]
    fn filters_omitted_without_children() {
        let mut query = query();
        query.search = Some("Pieris".to_string());
        query.resources.set(&["R3".to_string(), "R1".to_string()]).unwrap();
        assert_eq!(
            serde_json::to_value(query.request_body(false)).unwrap(),
            json!({"query": {"search": "Pieris"}, "resource_ids": ["R1", "R3"]})
        );
    }

    #[test]
    fn blank_search_is_dropped() {
        let mut query = query();
        query.search = Some("   ".to_string());
        assert_eq!(query.query_body(false).search, None);
    }

    #[test]
    fn ignore_temp_changes_the_body() {
        let mut query = query();
        query
            .filters
            .add_term(ROOT, "exists", json!({"fields": ["associatedMedia"]}), DisplayMeta::default().temporary())
            .unwrap();
        assert!(query.request_body(false).query.filters.is_some());
        assert_eq!(query.request_body(true).query.filters, None);
    }

    #[test]
    fn set_request_body_applies_valid_parts() {
        let mut query = query();
        query.resources.set(&["R2".to_string()]).unwrap();

        let body: RequestBody = serde_json::from_value(json!({
            "query": {"search": 1758, "filters": {"and": [{"string_equals": {"fields": ["genus"], "value": "Pieris"}}]}},
            "resource_ids": ["R1", "X9"],
            "version": 1_700_000_000_000_u64
        }))
        .unwrap();

        assert!(!query.set_request_body(&body));
        assert_eq!(
            query.parsing_error.resource_ids,
            Some(InvalidResourceIds {
                ids: vec!["X9".to_string()]
            })
        );
        assert_eq!(query.parsing_error.query_body, None);
        assert_eq!(query.resources.selected(), ["R2".to_string()].as_slice());
        assert_eq!(query.search.as_deref(), Some("1758"));
        assert_eq!(query.filters.count(false), 2);
        assert_eq!(query.version, Some(json!(1_700_000_000_000_u64)));
    }

    #[test]
    fn unparseable_filters_keep_previous_tree() {
        let mut query = query();
        query.search = Some("Papilio".to_string());
        query
            .filters
            .add_term(ROOT, "exists", json!({"fields": ["x"]}), DisplayMeta::default())
            .unwrap();
        let before = query.filters.clone();

        let body: RequestBody = serde_json::from_value(json!({
            "query": {"search": "Pieris", "filters": {"and": [{"or": "nope"}]}},
            "resource_ids": ["R1"]
        }))
        .unwrap();

        assert!(!query.set_request_body(&body));
        assert!(query.parsing_error.query_body.is_some());
        assert_eq!(query.filters, before);
        assert_eq!(query.search.as_deref(), Some("Papilio"));
        assert_eq!(query.resources.selected(), ["R1".to_string()].as_slice());
    }

    #[test]
    fn hash_ignores_paging_state() {
        let mut query = query();
        query.search = Some("Pieris".to_string());
        let first = query.hash();
        query.after = Some(json!([1, "nhm-R1"]));
        assert_eq!(query.hash(), first);
        query.search = Some("Papilio".to_string());
        assert_ne!(query.hash(), first);
    }

    #[test]
    fn reset_clears_everything() {
        let mut query = query();
        query.search = Some("Pieris".to_string());
        query.resources.select_all();
        query
            .filters
            .add_term(ROOT, "exists", json!({"fields": ["x"]}), DisplayMeta::default())
            .unwrap();
        query.reset();
        assert_eq!(query.request_body(false), RequestBody::default());
    }
}
