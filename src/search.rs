pub mod aggregator;
pub mod cursor;
pub mod headers;
pub mod images;
pub mod pages;
pub mod session;

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use self::{
    aggregator::{AggregatorOptions, PageOutcome, ResultAggregator},
    cursor::{AutocompleteCursor, CursorError, SearchCursor},
    headers::guess_headers,
    images::ImageFilter,
    pages::PageHistory,
    session::SessionTracker,
};
use crate::{
    outbound::{ApiError, Portal, PortalClient, RecordData},
    query::Query,
    resources::{Catalog, DescriptorCache},
    settings::{SearchSettings, Settings},
    slug::SlugCodec,
};

/// Batches pulled when an image search starts.
pub const INITIAL_BATCHES: usize = 4;

/// Progress of one kind of remote operation, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    pub loading: bool,
    pub failed: bool,
    pub attempted: bool,
    pub error: Option<String>,
}

impl Status {
    pub fn start(&mut self) {
        self.loading = true;
        self.failed = false;
        self.attempted = true;
        self.error = None;
    }

    pub fn succeed(&mut self) {
        self.loading = false;
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.loading = false;
        self.failed = true;
        self.error = Some(error.to_string());
    }
}

/// Everything the searches share: the transport, the catalog and the
/// descriptor cache. Build one and hand it to each search.
pub struct SearchContext {
    pub portal: Arc<dyn Portal>,
    pub settings: SearchSettings,
    pub catalog: Arc<Catalog>,
    pub descriptors: Arc<DescriptorCache>,
    pub catalog_status: Status,
}

impl SearchContext {
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let client = PortalClient::new(&settings.portal)
            .with_context(|| format!("cannot reach {}", settings.portal.base_url))?;
        Ok(Self::with_portal(Arc::new(client), settings.search.clone()).await)
    }

    /// A failed catalog load leaves an empty catalog and a failed status.
    pub async fn with_portal(portal: Arc<dyn Portal>, settings: SearchSettings) -> Self {
        let mut catalog_status = Status::default();
        catalog_status.start();
        let catalog = match Catalog::load(portal.as_ref(), settings.catalog_limit).await {
            Ok(catalog) => {
                catalog_status.succeed();
                catalog
            }
            Err(e) => {
                error!("could not load the resource catalog: {e}");
                catalog_status.fail(&e);
                Catalog::default()
            }
        };
        let descriptors = Arc::new(DescriptorCache::new(&catalog));
        Self {
            portal,
            settings,
            catalog: Arc::new(catalog),
            descriptors,
            catalog_status,
        }
    }

    pub fn query(&self) -> Query {
        Query::new(Arc::clone(&self.catalog))
    }

    pub fn image_search(&self) -> ImageSearch {
        ImageSearch::new(self)
    }

    pub fn paged_search(&self) -> PagedSearch {
        PagedSearch::new(self)
    }

    pub fn slugs(&self) -> SlugCodec {
        SlugCodec::new(Arc::clone(&self.portal))
    }

    pub fn autocomplete(&self, query: &Query, field: &str, prefix: &str) -> AutocompleteCursor {
        AutocompleteCursor::new(
            Arc::clone(&self.portal),
            query.query_body(false),
            query.resources.sorted(),
            field,
            prefix,
        )
    }

    pub async fn count(&self, query: &Query) -> Result<u64, ApiError> {
        SearchCursor::count(self.portal.as_ref(), &query.request_body(false)).await
    }
}

/// AND an `exists` term over `fields` into `filters` unless already there.
pub fn with_image_filter(filters: Option<Value>, fields: &[String]) -> Value {
    let term = json!({"exists": {"fields": fields}});
    match filters {
        None => json!({"and": [term]}),
        Some(Value::Object(mut map)) if map.len() == 1 && map.contains_key("and") => {
            if let Some(Value::Array(items)) = map.get_mut("and") {
                if !items.contains(&term) {
                    items.push(term);
                }
            }
            Value::Object(map)
        }
        Some(other) => json!({"and": [term, other]}),
    }
}

/// The image viewer: records with IIIF images, loaded a batch at a time
/// while the image servers keep answering.
pub struct ImageSearch {
    portal: Arc<dyn Portal>,
    settings: SearchSettings,
    sessions: Arc<SessionTracker>,
    aggregator: ResultAggregator,
    cursor: Option<SearchCursor>,
    status: Status,
}

impl ImageSearch {
    pub fn new(context: &SearchContext) -> Self {
        let options = AggregatorOptions {
            failure_ratio: context.settings.autoload_failure_ratio,
            min_sample: context.settings.autoload_min_sample,
            require_images: true,
            image_filter: ImageFilter::default(),
        };
        Self {
            portal: Arc::clone(&context.portal),
            settings: context.settings.clone(),
            sessions: SessionTracker::new(),
            aggregator: ResultAggregator::new(
                Arc::clone(&context.portal),
                Arc::clone(&context.descriptors),
                options,
            ),
            cursor: None,
            status: Status::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn has_more(&self) -> bool {
        self.cursor.as_ref().is_some_and(|c| !c.is_exhausted())
    }

    pub fn auto_load_suppressed(&self) -> bool {
        self.aggregator.auto_load_suppressed()
    }

    /// Replace the query. The previous session is cancelled and its results
    /// dropped before anything is loaded for the new one.
    pub async fn set_query(&mut self, query: &Query, image_filter: ImageFilter) -> PageOutcome {
        let fields = query.resources.image_fields();
        if fields.is_empty() {
            warn!("none of the selected resources has an image field");
        }
        let mut body = query.request_body(false);
        body.query.filters = Some(with_image_filter(body.query.filters.take(), &fields));
        body.after = None;

        // Supersede the old session before clearing what it left behind.
        self.cursor = Some(SearchCursor::open(
            Arc::clone(&self.portal),
            &self.sessions,
            body,
            self.settings.page_size,
            self.settings.buffer_size,
        ));
        self.aggregator.reset();
        self.aggregator.set_image_filter(image_filter);
        self.status = Status::default();
        self.load(INITIAL_BATCHES).await
    }

    /// One more batch, unless the results are exhausted or too many images
    /// have failed.
    pub async fn load_more(&mut self) -> Option<PageOutcome> {
        if !self.has_more() {
            return None;
        }
        if self.auto_load_suppressed() {
            info!("not loading more: too many image failures");
            return None;
        }
        Some(self.load(1).await)
    }

    async fn load(&mut self, batches: usize) -> PageOutcome {
        let Some(cursor) = self.cursor.as_mut() else {
            return PageOutcome::default();
        };
        self.status.start();
        let records = cursor.fetch_batch(batches).await;
        if let Some(total) = cursor.total() {
            self.aggregator.set_total(cursor.session(), total);
        }
        let outcome = self.aggregator.add_page(cursor.session(), records).await;
        match cursor.failure() {
            Some(failure) => self.status.fail(failure),
            None => self.status.succeed(),
        }
        outcome
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: usize,
    pub records: Vec<RecordData>,
    pub total: u64,
    /// Matches without the temporary filters applied.
    pub unfiltered_total: u64,
    pub has_next: bool,
}

/// The table view: one page of records at a time, with a page history that
/// can be shared as a URL parameter.
pub struct PagedSearch {
    portal: Arc<dyn Portal>,
    settings: SearchSettings,
    sessions: Arc<SessionTracker>,
    history: PageHistory,
    headers: Vec<Vec<String>>,
    status: Status,
    invalidated: bool,
}

impl PagedSearch {
    pub fn new(context: &SearchContext) -> Self {
        Self {
            portal: Arc::clone(&context.portal),
            settings: context.settings.clone(),
            sessions: SessionTracker::new(),
            history: PageHistory::default(),
            headers: Vec::new(),
            status: Status::default(),
            invalidated: false,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn headers(&self) -> &[Vec<String>] {
        &self.headers
    }

    pub fn page_param(&self) -> String {
        self.history.to_param()
    }

    /// Mark shown results as out of date with the query.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Load a page history from a URL parameter and return the page to run.
    /// An unreadable parameter starts from the first page.
    pub fn restore_page_param(&mut self, param: &str) -> usize {
        match PageHistory::from_param(param) {
            Ok(history) => self.history = history,
            Err(e) => {
                warn!("ignoring page parameter: {e}");
                self.history.clear();
            }
        }
        self.history.page()
    }

    /// Run the query for `page`. Page 0 starts a fresh history and refreshes
    /// the column headers; later pages reuse the stored `after` tokens.
    pub async fn run(&mut self, query: &Query, page: usize) -> Result<PageResult, CursorError> {
        let session = self.sessions.begin(query.hash());
        self.status.start();

        let sorted = query.resources.sorted();
        if page == 0 {
            self.history.clear();
            self.headers = guess_headers(
                self.portal.as_ref(),
                &query.filters,
                &query.request_body(false),
                self.settings.guess_fields_size,
            )
            .await;
        } else if !self.history.set_page(page) {
            warn!("page {page} is not reachable yet, showing the last known page");
            self.history.set_page(self.history.known_pages() - 1);
        }

        let mut body = query.request_body(false).with_size(self.settings.page_size);
        body.after = self.history.after(&sorted);

        let result = tokio::select! {
            biased;
            () = session.cancelled() => None,
            result = self.portal.multisearch(&body) => Some(result),
        };
        let result = match result {
            None => return Err(CursorError::Superseded(session.tag())),
            Some(Err(e)) => {
                self.status.fail(&e);
                return Err(e.into());
            }
            Some(Ok(result)) => result,
        };
        if !session.is_current() {
            return Err(CursorError::Superseded(session.tag()));
        }

        if let Some(after) = result.after.as_ref().filter(|a| !a.is_null()) {
            self.history.record(after, &sorted);
        }

        let unfiltered_total = if query.filters.temporary_filters().is_empty() {
            result.total
        } else {
            let unfiltered = query.request_body(true);
            match SearchCursor::count(self.portal.as_ref(), &unfiltered).await {
                Ok(total) => total,
                Err(e) => {
                    warn!("could not count without temporary filters: {e}");
                    result.total
                }
            }
        };
        if !session.is_current() {
            return Err(CursorError::Superseded(session.tag()));
        }

        self.invalidated = false;
        self.status.succeed();
        info!(
            "page {} of session {}: {} records of {}",
            self.history.page(),
            session.tag(),
            result.records.len(),
            result.total
        );
        Ok(PageResult {
            page: self.history.page(),
            records: result.records,
            total: result.total,
            unfiltered_total,
            has_next: self.history.has_next(),
        })
    }
}
