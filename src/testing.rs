//! An in-memory `Portal` for driving the higher layers in tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::outbound::{
    ApiError, AutocompleteRequest, AutocompleteResult, GuessedFields, MultisearchResult,
    PackageData, Portal, RecordData, RequestBody, SlugInfo,
};

#[derive(Default)]
struct State {
    /// Search pages keyed by the JSON of the `after` they answer.
    pages: HashMap<String, MultisearchResult>,
    failing_pages: HashSet<String>,
    page_delays: HashMap<String, Duration>,
    searches: Vec<RequestBody>,
    autocomplete: HashMap<String, AutocompleteResult>,
    autocomplete_requests: Vec<AutocompleteRequest>,
    slugs: HashMap<String, RequestBody>,
    reserved: HashSet<String>,
    next_slug: u32,
    guessed: Option<Vec<GuessedFields>>,
    packages: Vec<Value>,
    packages_fail: bool,
    last_limit: Option<u32>,
    resources: HashMap<String, Map<String, Value>>,
    failing_images: HashSet<String>,
    image_delay: Option<Duration>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub(crate) struct FakePortal {
    state: Mutex<State>,
}

fn after_key(after: Option<&Value>) -> String {
    after.cloned().unwrap_or(Value::Null).to_string()
}

pub(crate) fn record(resource: &str, id: u64) -> RecordData {
    RecordData {
        resource: resource.to_string(),
        data: json!({"_id": id}).as_object().cloned().unwrap_or_default(),
        iiif: None,
    }
}

impl FakePortal {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, action: &'static str) {
        *self.state().calls.entry(action).or_default() += 1;
    }

    pub(crate) fn calls(&self, action: &str) -> usize {
        self.state().calls.get(action).copied().unwrap_or_default()
    }

    /// Answer a search carrying `after` with `records`, continuing at `next`.
    pub(crate) fn add_page(
        &self,
        after: Option<Value>,
        records: Vec<RecordData>,
        total: u64,
        next: Option<Value>,
    ) {
        self.state().pages.insert(
            after_key(after.as_ref()),
            MultisearchResult {
                records,
                total,
                after: next,
            },
        );
    }

    pub(crate) fn fail_page(&self, after: Option<Value>) {
        self.state().failing_pages.insert(after_key(after.as_ref()));
    }

    pub(crate) fn delay_page(&self, after: Option<Value>, delay: Duration) {
        self.state()
            .page_delays
            .insert(after_key(after.as_ref()), delay);
    }

    pub(crate) fn searches(&self) -> Vec<RequestBody> {
        self.state().searches.clone()
    }

    pub(crate) fn add_autocomplete(&self, after: Option<Value>, values: Vec<Value>, next: Option<Value>) {
        self.state().autocomplete.insert(
            after_key(after.as_ref()),
            AutocompleteResult {
                values,
                after: next,
            },
        );
    }

    pub(crate) fn autocomplete_requests(&self) -> Vec<AutocompleteRequest> {
        self.state().autocomplete_requests.clone()
    }

    pub(crate) fn add_slug(&self, slug: &str, body: RequestBody) {
        self.state().slugs.insert(slug.to_string(), body);
    }

    pub(crate) fn reserve(&self, slug: &str) {
        self.state().reserved.insert(slug.to_string());
    }

    pub(crate) fn set_guessed(&self, groups: Vec<Value>) {
        let groups = groups
            .into_iter()
            .map(|g| serde_json::from_value(g).unwrap_or(GuessedFields { fields: Map::new() }))
            .collect();
        self.state().guessed = Some(groups);
    }

    pub(crate) fn set_packages(&self, packages: Vec<Value>) {
        self.state().packages = packages;
    }

    pub(crate) fn fail_packages(&self) {
        self.state().packages_fail = true;
    }

    pub(crate) fn last_limit(&self) -> Option<u32> {
        self.state().last_limit
    }

    pub(crate) fn add_resource(&self, raw: Value) {
        let raw = raw.as_object().cloned().unwrap_or_default();
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.state().resources.insert(id, raw);
    }

    pub(crate) fn fail_image(&self, url: &str) {
        self.state().failing_images.insert(url.to_string());
    }

    pub(crate) fn delay_images(&self, delay: Duration) {
        self.state().image_delay = Some(delay);
    }
}

fn rejected(action: &str, status: u16, message: &str) -> ApiError {
    ApiError::Rejected {
        action: action.to_string(),
        status,
        message: message.to_string(),
    }
}

#[async_trait]
impl Portal for FakePortal {
    async fn multisearch(&self, body: &RequestBody) -> Result<MultisearchResult, ApiError> {
        self.count("datastore_multisearch");
        let key = after_key(body.after.as_ref());
        let delay = {
            let mut state = self.state();
            state.searches.push(body.clone());
            state.page_delays.get(&key).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        if state.failing_pages.contains(&key) {
            return Err(ApiError::Status {
                action: "datastore_multisearch".to_string(),
                status: 500,
            });
        }
        let mut page = state.pages.get(&key).cloned().unwrap_or(MultisearchResult {
            records: Vec::new(),
            total: 0,
            after: None,
        });
        if body.size == Some(0) {
            page.records.clear();
            page.after = None;
        }
        Ok(page)
    }

    async fn value_autocomplete(
        &self,
        request: &AutocompleteRequest,
    ) -> Result<AutocompleteResult, ApiError> {
        self.count("datastore_value_autocomplete");
        let key = after_key(request.after.as_ref());
        let mut state = self.state();
        state.autocomplete_requests.push(request.clone());
        Ok(state
            .autocomplete
            .get(&key)
            .cloned()
            .unwrap_or(AutocompleteResult {
                values: Vec::new(),
                after: None,
            }))
    }

    async fn resolve_slug(&self, slug: &str) -> Result<RequestBody, ApiError> {
        self.count("datastore_resolve_slug");
        self.state()
            .slugs
            .get(slug)
            .cloned()
            .ok_or_else(|| rejected("datastore_resolve_slug", 404, "Slug not found"))
    }

    async fn create_slug(&self, body: &RequestBody) -> Result<SlugInfo, ApiError> {
        self.count("datastore_create_slug");
        let mut state = self.state();
        if let Some((slug, _)) = state.slugs.iter().find(|(_, b)| *b == body) {
            let slug = slug.clone();
            let is_reserved = state.reserved.contains(&slug);
            return Ok(SlugInfo { slug, is_reserved });
        }
        state.next_slug += 1;
        let slug = format!("slug-{}", state.next_slug);
        state.slugs.insert(slug.clone(), body.clone());
        Ok(SlugInfo {
            slug,
            is_reserved: false,
        })
    }

    async fn edit_slug(&self, current_slug: &str, new_slug: &str) -> Result<(), ApiError> {
        self.count("datastore_edit_slug");
        let mut state = self.state();
        if state.slugs.contains_key(new_slug) {
            return Err(rejected("datastore_edit_slug", 409, "Slug already exists"));
        }
        let body = state
            .slugs
            .remove(current_slug)
            .ok_or_else(|| rejected("datastore_edit_slug", 404, "Slug not found"))?;
        state.slugs.insert(new_slug.to_string(), body);
        state.reserved.insert(new_slug.to_string());
        Ok(())
    }

    async fn guess_fields(&self, _body: &RequestBody) -> Result<Vec<GuessedFields>, ApiError> {
        self.count("datastore_guess_fields");
        self.state()
            .guessed
            .clone()
            .ok_or_else(|| rejected("datastore_guess_fields", 500, "guess failed"))
    }

    async fn package_list(&self, limit: u32) -> Result<Vec<PackageData>, ApiError> {
        self.count("current_package_list_with_resources");
        let mut state = self.state();
        state.last_limit = Some(limit);
        if state.packages_fail {
            return Err(ApiError::Status {
                action: "current_package_list_with_resources".to_string(),
                status: 503,
            });
        }
        Ok(state
            .packages
            .iter()
            .filter_map(|p| serde_json::from_value(p.clone()).ok())
            .collect())
    }

    async fn resource_show(&self, id: &str) -> Result<Map<String, Value>, ApiError> {
        self.count("resource_show");
        self.state()
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| rejected("resource_show", 404, "Not found"))
    }

    async fn image_info(&self, url: &str) -> Result<Value, ApiError> {
        self.count("image_info");
        let delay = self.state().image_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state().failing_images.contains(url) {
            return Err(ApiError::Status {
                action: url.to_string(),
                status: 500,
            });
        }
        Ok(json!({"@id": url.trim_end_matches("/info.json"), "width": 1024, "height": 768}))
    }
}
