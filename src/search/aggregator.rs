//! Accumulates the records of one search session, loading each record's
//! image information alongside it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    images::{derive_images, record_title, ImageFilter, ImageRef},
    session::SessionHandle,
};
use crate::{
    outbound::{Portal, RecordData},
    resources::DescriptorCache,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedImage {
    pub image: ImageRef,
    /// The IIIF information document, for images that have one.
    pub info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub key: String,
    pub resource: String,
    pub title: String,
    pub data: Map<String, Value>,
    pub manifest: Option<String>,
    pub images: Vec<LoadedImage>,
}

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// Auto-loading stops once more than this share of image fetches fail.
    pub failure_ratio: f64,
    /// Image fetches to attempt before the failure ratio is considered.
    pub min_sample: usize,
    /// Skip records that have no IIIF images.
    pub require_images: bool,
    pub image_filter: ImageFilter,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_sample: 10,
            require_images: false,
            image_filter: ImageFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub committed: usize,
    /// Settled after their session was superseded.
    pub discarded: usize,
    /// Left out because they carry no images.
    pub skipped: usize,
    pub failed_images: usize,
}

#[derive(Debug, Default)]
struct Inner {
    records: IndexMap<String, Record>,
    total: u64,
    requested_images: usize,
    failed_images: usize,
    suppressed: bool,
}

enum Settled {
    Committed { failed: usize },
    Discarded,
    Skipped,
}

/// Cheap to clone; clones share the same result set.
#[derive(Clone)]
pub struct ResultAggregator {
    portal: Arc<dyn Portal>,
    descriptors: Arc<DescriptorCache>,
    options: AggregatorOptions,
    inner: Arc<Mutex<Inner>>,
}

impl ResultAggregator {
    pub fn new(
        portal: Arc<dyn Portal>,
        descriptors: Arc<DescriptorCache>,
        options: AggregatorOptions,
    ) -> Self {
        Self {
            portal,
            descriptors,
            options,
            inner: Arc::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    pub fn set_image_filter(&mut self, filter: ImageFilter) {
        self.options.image_filter = filter;
    }

    /// Drop every record and counter. Call before starting a new session.
    pub fn reset(&self) {
        *self.inner() = Inner::default();
    }

    pub fn set_total(&self, session: &SessionHandle, total: u64) {
        if session.is_current() {
            self.inner().total = total;
        }
    }

    pub fn total(&self) -> u64 {
        self.inner().total
    }

    pub fn len(&self) -> usize {
        self.inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner().records.values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.inner().records.get(key).cloned()
    }

    /// `(requested, failed)` image fetches in this session.
    pub fn image_stats(&self) -> (usize, usize) {
        let inner = self.inner();
        (inner.requested_images, inner.failed_images)
    }

    pub fn auto_load_suppressed(&self) -> bool {
        let inner = self.inner();
        Self::breaker_tripped(&self.options, inner.requested_images, inner.failed_images)
    }

    fn breaker_tripped(options: &AggregatorOptions, requested: usize, failed: usize) -> bool {
        if requested == 0 || requested < options.min_sample {
            return false;
        }
        failed as f64 / requested as f64 > options.failure_ratio
    }

    /// Settle every record of a page concurrently and commit those whose
    /// session is still current.
    pub async fn add_page(&self, session: &SessionHandle, records: Vec<RecordData>) -> PageOutcome {
        let settled = join_all(records.into_iter().map(|r| self.settle(session, r))).await;
        let mut outcome = PageOutcome::default();
        for result in settled {
            match result {
                Settled::Committed { failed } => {
                    outcome.committed += 1;
                    outcome.failed_images += failed;
                }
                Settled::Discarded => outcome.discarded += 1,
                Settled::Skipped => outcome.skipped += 1,
            }
        }
        if outcome.discarded > 0 {
            debug!(
                "session {}: discarded {} stale records",
                session.tag(),
                outcome.discarded
            );
        }
        info!(
            "session {}: {} records committed, {} images failed",
            session.tag(),
            outcome.committed,
            outcome.failed_images
        );
        outcome
    }

    async fn settle(&self, session: &SessionHandle, record: RecordData) -> Settled {
        let has_iiif = record
            .iiif
            .as_ref()
            .and_then(|m| m.get("items"))
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty());
        if self.options.require_images && !has_iiif {
            debug!("record {} has no IIIF images", record.key());
            return Settled::Skipped;
        }

        let descriptor = self
            .descriptors
            .describe(self.portal.as_ref(), &record.resource)
            .await
            .ok();
        let images = derive_images(&record, descriptor.as_deref());
        let to_fetch = images.iter().filter(|i| i.info_url.is_some()).count();
        {
            let mut inner = self.inner();
            if !session.is_current() {
                return Settled::Discarded;
            }
            inner.requested_images += to_fetch;
        }

        let fetched = join_all(images.into_iter().map(|image| async move {
            match &image.info_url {
                Some(url) => match self.portal.image_info(url).await {
                    Ok(info) => Ok(LoadedImage {
                        image,
                        info: Some(info),
                    }),
                    Err(e) => {
                        warn!("image {} failed: {e}", image.url);
                        Err(())
                    }
                },
                None => Ok(LoadedImage { image, info: None }),
            }
        }))
        .await;

        let failed = fetched.iter().filter(|r| r.is_err()).count();
        let loaded: Vec<LoadedImage> = fetched
            .into_iter()
            .filter_map(Result::ok)
            .filter(|loaded| self.options.image_filter.matches(&loaded.image))
            .collect();

        let key = record.key();
        let committed = Record {
            title: record_title(&record, descriptor.as_deref()),
            manifest: record
                .iiif
                .as_ref()
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            key: key.clone(),
            resource: record.resource,
            data: record.data,
            images: loaded,
        };

        // The session may have moved on while the images loaded.
        let mut inner = self.inner();
        if !session.is_current() {
            return Settled::Discarded;
        }
        inner.failed_images += failed;
        inner.records.insert(key, committed);
        let tripped =
            Self::breaker_tripped(&self.options, inner.requested_images, inner.failed_images);
        if tripped && !inner.suppressed {
            inner.suppressed = true;
            warn!(
                "{} of {} image requests failed, auto-loading suppressed",
                inner.failed_images, inner.requested_images
            );
        }
        Settled::Committed { failed }
    }
}
