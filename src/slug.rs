//! Short shareable names for stored queries.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    outbound::{ApiError, Portal, RequestBody, SlugInfo},
    query::Query,
    search::Status,
};

#[derive(Debug, thiserror::Error)]
pub enum SlugError {
    #[error("no query is stored under `{0}`")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct SlugCodec {
    portal: Arc<dyn Portal>,
    current: Option<SlugInfo>,
    current_body: Option<RequestBody>,
    last_resolved: Option<(String, RequestBody)>,
    status: Status,
    edit_status: Status,
}

impl SlugCodec {
    pub fn new(portal: Arc<dyn Portal>) -> Self {
        Self {
            portal,
            current: None,
            current_body: None,
            last_resolved: None,
            status: Status::default(),
            edit_status: Status::default(),
        }
    }

    /// The slug last created for the displayed query.
    pub fn current(&self) -> Option<&SlugInfo> {
        self.current.as_ref()
    }

    pub fn last_resolved(&self) -> Option<&(String, RequestBody)> {
        self.last_resolved.as_ref()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn edit_status(&self) -> &Status {
        &self.edit_status
    }

    /// Forget the current slug, e.g. because the query changed.
    pub fn invalidate(&mut self) {
        self.current = None;
        self.current_body = None;
    }

    pub async fn resolve(&mut self, slug: &str) -> Result<RequestBody, SlugError> {
        match self.portal.resolve_slug(slug).await {
            Ok(body) => {
                info!("resolved slug {slug}");
                self.last_resolved = Some((slug.to_string(), body.clone()));
                Ok(body)
            }
            Err(e) if e.is_not_found() => {
                warn!("slug {slug} not found");
                Err(SlugError::NotFound(slug.to_string()))
            }
            Err(e) => {
                warn!("could not resolve slug {slug}: {e}");
                Err(e.into())
            }
        }
    }

    /// Resolve `slug` and apply it to `query`. On any failure the query is
    /// left exactly as it was. `Ok(false)` means parts of the stored query
    /// could not be applied; see `query.parsing_error`.
    pub async fn resolve_into(&mut self, slug: &str, query: &mut Query) -> Result<bool, SlugError> {
        let body = self.resolve(slug).await?;
        Ok(query.set_request_body(&body))
    }

    /// Store the shareable form of `query` and remember its slug.
    pub async fn create(&mut self, query: &Query) -> Result<SlugInfo, SlugError> {
        let body = query.request_body(true).shareable();
        self.status.start();
        match self.portal.create_slug(&body).await {
            Ok(info) => {
                info!("created slug {} (reserved: {})", info.slug, info.is_reserved);
                self.status.succeed();
                self.current = Some(info.clone());
                self.current_body = Some(body);
                Ok(info)
            }
            Err(e) => {
                self.status.fail(&e);
                self.current = None;
                self.current_body = None;
                Err(e.into())
            }
        }
    }

    /// Rename `old` to the reserved slug `new`. The current slug only
    /// changes when the edit succeeds.
    pub async fn edit(&mut self, old: &str, new: &str) -> bool {
        self.edit_status.start();
        let new = new.trim();
        if new.is_empty() {
            self.edit_status.fail("the new slug is empty");
            return false;
        }
        if let Err(e) = self.portal.edit_slug(old, new).await {
            warn!("could not rename slug {old} to {new}: {e}");
            self.edit_status.fail(&e);
            return false;
        }
        self.edit_status.succeed();
        info!("renamed slug {old} to {new}");

        // Ask again so the reserved slug is what gets shown.
        let refreshed = match &self.current_body {
            Some(body) => self.portal.create_slug(body).await.ok(),
            None => None,
        };
        self.current = Some(refreshed.unwrap_or_else(|| SlugInfo {
            slug: new.to_string(),
            is_reserved: true,
        }));
        true
    }
}
