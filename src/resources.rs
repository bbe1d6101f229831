//! The catalog of searchable resources and the selection of resources a
//! query runs against.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::outbound::{ApiError, PackageData, Portal};

const DEFAULT_TITLE_FIELD: &str = "_id";
/// What the portal stores in `_image_field` when a resource has no images.
const NO_IMAGE_FIELD: &str = "None";

/// Requested resource ids that are not in the catalog, all of them at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource ids: {}", ids.join(", "))]
pub struct InvalidResourceIds {
    pub ids: Vec<String>,
}

/// Read-only metadata about one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    pub package_id: String,
    pub package_title: String,
    pub title_field: String,
    pub subtitle_field: Option<String>,
    pub image_field: Option<String>,
    pub image_delimiter: String,
    pub image_licence: Option<String>,
    /// Darwin Core formatted resource.
    pub dwc: bool,
    pub package_url: String,
    pub resource_url: String,
    pub raw: Map<String, Value>,
}

impl ResourceDescriptor {
    pub fn from_raw(raw: Map<String, Value>, package_title: &str) -> Option<Self> {
        let id = string_field(&raw, "id")?;
        let package_id = string_field(&raw, "package_id").unwrap_or_default();
        let package_url = format!("/dataset/{package_id}");
        let resource_url = format!("{package_url}/resource/{id}");
        Some(Self {
            name: string_field(&raw, "name").unwrap_or_else(|| id.clone()),
            package_title: package_title.to_string(),
            title_field: string_field(&raw, "_title_field")
                .unwrap_or_else(|| DEFAULT_TITLE_FIELD.to_string()),
            subtitle_field: string_field(&raw, "_subtitle_field"),
            image_field: string_field(&raw, "_image_field").filter(|f| f != NO_IMAGE_FIELD),
            image_delimiter: string_field(&raw, "_image_delimiter").unwrap_or_default(),
            image_licence: string_field(&raw, "_image_licence"),
            dwc: raw
                .get("format")
                .and_then(Value::as_str)
                .is_some_and(|f| f.eq_ignore_ascii_case("dwc")),
            id,
            package_id,
            package_url,
            resource_url,
            raw,
        })
    }
}

/// Non-empty string members only.
fn string_field(raw: &Map<String, Value>, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub id: String,
    pub title: String,
    pub resources: Vec<Arc<ResourceDescriptor>>,
}

impl Package {
    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.id.as_str())
    }
}

/// Packages that have at least one datastore-backed resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    packages: Vec<Package>,
}

impl Catalog {
    pub async fn load(portal: &dyn Portal, limit: u32) -> Result<Self, ApiError> {
        let packages = portal.package_list(limit).await?;
        let catalog = Self::from_packages(packages);
        info!(
            "catalog loaded: {} packages, {} resources",
            catalog.packages.len(),
            catalog.resource_count()
        );
        Ok(catalog)
    }

    pub fn from_packages(packages: Vec<PackageData>) -> Self {
        let packages = packages
            .into_iter()
            .filter_map(|pkg| {
                let title = pkg.title.or(pkg.name).unwrap_or_else(|| pkg.id.clone());
                let resources: Vec<_> = pkg
                    .resources
                    .into_iter()
                    .filter(|r| r.get("datastore_active").and_then(Value::as_bool) == Some(true))
                    .filter_map(|mut raw| {
                        if !raw.contains_key("package_id") {
                            raw.insert("package_id".to_string(), Value::String(pkg.id.clone()));
                        }
                        ResourceDescriptor::from_raw(raw, &title)
                    })
                    .map(Arc::new)
                    .collect();
                (!resources.is_empty()).then_some(Package {
                    id: pkg.id,
                    title,
                    resources,
                })
            })
            .collect();
        Self { packages }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<ResourceDescriptor>> {
        self.packages.iter().flat_map(|p| p.resources.iter())
    }

    pub fn resource_count(&self) -> usize {
        self.resources().count()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ResourceDescriptor>> {
        self.resources().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.resources().map(|r| r.id.clone()).collect()
    }
}

/// The resources in scope for a query. An empty selection means every
/// resource in the catalog.
#[derive(Debug, Clone)]
pub struct ResourceSelector {
    catalog: Arc<Catalog>,
    selected: Vec<String>,
}

impl ResourceSelector {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            selected: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn validate(&self, ids: &[String]) -> Result<Vec<String>, InvalidResourceIds> {
        let invalid: Vec<String> = ids
            .iter()
            .filter(|id| !self.catalog.contains(id))
            .cloned()
            .collect();
        if invalid.is_empty() {
            Ok(ids.to_vec())
        } else {
            Err(InvalidResourceIds { ids: invalid })
        }
    }

    /// Replace the selection. Nothing changes when any id is unknown.
    pub fn set(&mut self, ids: &[String]) -> Result<(), InvalidResourceIds> {
        self.selected = self.validate(ids)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn select_all(&mut self) {
        self.selected = self.catalog.all_ids();
    }

    /// Add the package's resources if none of them are selected, otherwise
    /// remove exactly that package's resources.
    pub fn toggle_group(&mut self, package_ix: usize) -> bool {
        let Some(package) = self.catalog.packages().get(package_ix) else {
            return false;
        };
        let ids: Vec<&str> = package.resource_ids().collect();
        let any_selected = ids.iter().any(|id| self.selected.iter().any(|s| s == id));
        if any_selected {
            self.selected.retain(|s| !ids.contains(&s.as_str()));
        } else {
            for id in ids {
                if !self.selected.iter().any(|s| s == id) {
                    self.selected.push(id.to_string());
                }
            }
        }
        debug!(
            "toggled package {}: {} resources selected",
            package.id,
            self.selected.len()
        );
        true
    }

    pub fn set_group(&mut self, package_ix: usize, on: bool) -> bool {
        let Some(package) = self.catalog.packages().get(package_ix) else {
            return false;
        };
        let is_on = package
            .resource_ids()
            .any(|id| self.selected.iter().any(|s| s == id));
        if is_on != on {
            self.toggle_group(package_ix);
        }
        true
    }

    /// Selected ids, sorted and de-duplicated, as sent on the wire.
    pub fn sorted(&self) -> Vec<String> {
        self.selected
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn current_descriptors(&self) -> Vec<Arc<ResourceDescriptor>> {
        self.catalog
            .resources()
            .filter(|r| self.selected.is_empty() || self.selected.contains(&r.id))
            .cloned()
            .collect()
    }

    /// Distinct image fields of the resources in scope.
    pub fn image_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for field in self
            .current_descriptors()
            .iter()
            .filter_map(|r| r.image_field.clone())
        {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }
}

/// Descriptors by resource id, filled from the catalog first and from
/// `resource_show` for anything the catalog does not list.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: Mutex<HashMap<String, Arc<ResourceDescriptor>>>,
}

impl DescriptorCache {
    pub fn new(catalog: &Catalog) -> Self {
        let entries = catalog
            .resources()
            .map(|r| (r.id.clone(), Arc::clone(r)))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn cached(&self, id: &str) -> Option<Arc<ResourceDescriptor>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub async fn describe(
        &self,
        portal: &dyn Portal,
        id: &str,
    ) -> Result<Arc<ResourceDescriptor>, ApiError> {
        if let Some(found) = self.cached(id) {
            return Ok(found);
        }
        let raw = portal.resource_show(id).await?;
        let descriptor = ResourceDescriptor::from_raw(raw, "").ok_or_else(|| ApiError::Rejected {
            action: crate::outbound::RESOURCE_SHOW.to_string(),
            status: 200,
            message: format!("resource {id} has no id"),
        })?;
        let descriptor = Arc::new(descriptor);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert_with(|| Arc::clone(&descriptor));
        debug!("described resource {id}");
        Ok(descriptor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::testing::FakePortal;

    fn package(value: Value) -> PackageData {
        serde_json::from_value(value).unwrap()
    }

    /// Two packages: `specimens` (R1, R2 with images) and `index-lots` (R3);
    /// a third package has no active resources.
    pub(crate) fn sample_catalog() -> Catalog {
        Catalog::from_packages(vec![
            package(json!({
                "id": "specimens",
                "title": "Specimens",
                "resources": [
                    {"id": "R1", "name": "Collection specimens", "datastore_active": true,
                     "format": "dwc", "_image_field": "associatedMedia", "_title_field": "catalogNumber"},
                    {"id": "R2", "name": "Artefacts", "datastore_active": true,
                     "_image_field": "multimedia", "_image_delimiter": ";"},
                    {"id": "R9", "name": "Inactive", "datastore_active": false}
                ]
            })),
            package(json!({
                "id": "index-lots",
                "title": "Index lots",
                "resources": [{"id": "R3", "name": "Index lots", "datastore_active": true,
                               "_image_field": "None"}]
            })),
            package(json!({
                "id": "empty",
                "title": "Nothing active",
                "resources": [{"id": "R8", "datastore_active": false}]
            })),
        ])
    }

    fn selector() -> ResourceSelector {
        ResourceSelector::new(Arc::new(sample_catalog()))
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn catalog_keeps_only_active_resources() {
        let catalog = sample_catalog();
        assert_eq!(catalog.packages().len(), 2);
        assert_eq!(catalog.all_ids(), ids(&["R1", "R2", "R3"]));

        let r1 = catalog.get("R1").unwrap();
        assert!(r1.dwc);
        assert_eq!(r1.title_field, "catalogNumber");
        assert_eq!(r1.resource_url, "/dataset/specimens/resource/R1");
        assert_eq!(r1.package_title, "Specimens");

        let r3 = catalog.get("R3").unwrap();
        assert_eq!(r3.title_field, "_id");
        assert_eq!(r3.image_field, None);
    }

    #[test]
    fn validate_reports_every_unknown_id() {
        let selector = selector();
        assert_eq!(selector.validate(&ids(&["R1", "R3"])), Ok(ids(&["R1", "R3"])));
        assert_eq!(
            selector.validate(&ids(&["R1", "X1", "R9", "X2"])),
            Err(InvalidResourceIds {
                ids: ids(&["X1", "R9", "X2"])
            })
        );
    }

    #[test]
    fn set_with_unknown_ids_keeps_selection() {
        let mut selector = selector();
        selector.set(&ids(&["R2"])).unwrap();
        assert!(selector.set(&ids(&["R1", "nope"])).is_err());
        assert_eq!(selector.selected(), ids(&["R2"]).as_slice());
    }

    #[test]
    fn toggle_group_adds_then_removes_only_that_group() {
        let mut selector = selector();
        selector.set(&ids(&["R3", "R1"])).unwrap();

        // R1 is already in, so the specimens package is on and gets removed.
        assert!(selector.toggle_group(0));
        assert_eq!(selector.selected(), ids(&["R3"]).as_slice());

        assert!(selector.toggle_group(0));
        assert_eq!(selector.sorted(), ids(&["R1", "R2", "R3"]));

        assert!(!selector.toggle_group(7));
    }

    #[test]
    fn set_group_is_idempotent() {
        let mut selector = selector();
        selector.set_group(1, true);
        selector.set_group(1, true);
        assert_eq!(selector.selected(), ids(&["R3"]).as_slice());
        selector.set_group(1, false);
        assert!(selector.selected().is_empty());
    }

    #[test]
    fn empty_selection_means_every_resource() {
        let mut selector = selector();
        assert_eq!(selector.current_descriptors().len(), 3);
        assert_eq!(selector.image_fields(), ids(&["associatedMedia", "multimedia"]));

        selector.set(&ids(&["R3"])).unwrap();
        assert!(selector.image_fields().is_empty());

        selector.select_all();
        assert_eq!(selector.sorted(), ids(&["R1", "R2", "R3"]));
    }

    #[tokio::test]
    async fn descriptor_cache_falls_back_to_resource_show() {
        let portal = FakePortal::default();
        portal.add_resource(json!({"id": "R7", "name": "Extra", "_title_field": "scientificName"}));
        let cache = DescriptorCache::new(&sample_catalog());

        assert_eq!(cache.describe(&portal, "R1").await.unwrap().name, "Collection specimens");
        assert_eq!(portal.calls("resource_show"), 0);

        let extra = cache.describe(&portal, "R7").await.unwrap();
        assert_eq!(extra.title_field, "scientificName");
        cache.describe(&portal, "R7").await.unwrap();
        assert_eq!(portal.calls("resource_show"), 1);

        assert!(cache.describe(&portal, "R404").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn catalog_load_uses_limit() {
        let portal = FakePortal::default();
        portal.set_packages(vec![json!({
            "id": "p", "title": "P",
            "resources": [{"id": "R1", "datastore_active": true}]
        })]);
        let catalog = Catalog::load(&portal, 500).await.unwrap();
        assert_eq!(catalog.all_ids(), ids(&["R1"]));
        assert_eq!(portal.last_limit(), Some(500));
    }
}
