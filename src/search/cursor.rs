use std::{collections::VecDeque, sync::Arc};

use futures::Stream;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::session::{SessionHandle, SessionTag, SessionTracker};
use crate::{
    outbound::{ApiError, AutocompleteRequest, Portal, QueryBody, RecordData, RequestBody},
    utils::json_hash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Fetching,
    HasMore,
    Exhausted,
    /// The last page request failed; calling `next` again re-sends it.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("session {0} was superseded")]
    Superseded(SessionTag),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Pulls records from `datastore_multisearch` one at a time, requesting the
/// next page only when the buffered one has been drained.
pub struct SearchCursor {
    portal: Arc<dyn Portal>,
    session: SessionHandle,
    request: RequestBody,
    buffer: VecDeque<RecordData>,
    state: CursorState,
    total: Option<u64>,
    pages: usize,
    failure: Option<String>,
    batch_size: usize,
}

impl SearchCursor {
    /// Start a new session for `body` and return a cursor bound to it.
    pub fn open(
        portal: Arc<dyn Portal>,
        tracker: &Arc<SessionTracker>,
        body: RequestBody,
        page_size: u32,
        batch_size: usize,
    ) -> Self {
        let session = tracker.begin(json_hash(&body.shareable()));
        Self::with_session(portal, session, body.with_size(page_size), batch_size)
    }

    pub fn with_session(
        portal: Arc<dyn Portal>,
        session: SessionHandle,
        request: RequestBody,
        batch_size: usize,
    ) -> Self {
        Self {
            portal,
            session,
            request,
            buffer: VecDeque::new(),
            state: CursorState::Idle,
            total: None,
            pages: 0,
            failure: None,
            batch_size: batch_size.max(1),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted && self.buffer.is_empty()
    }

    /// Total matches reported by the most recent page.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Message of the last failed page request, cleared by the next success.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The `after` the next page request will carry.
    pub fn after(&self) -> Option<&Value> {
        self.request.after.as_ref()
    }

    pub async fn next(&mut self) -> Result<Option<RecordData>, CursorError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            if self.state == CursorState::Exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), CursorError> {
        let tag = self.session.tag();
        if !self.session.is_current() {
            return Err(CursorError::Superseded(tag));
        }
        self.state = CursorState::Fetching;
        let result = tokio::select! {
            biased;
            () = self.session.cancelled() => None,
            result = self.portal.multisearch(&self.request) => Some(result),
        };
        let Some(result) = result else {
            self.state = CursorState::Idle;
            debug!("session {tag}: page request abandoned");
            return Err(CursorError::Superseded(tag));
        };
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("session {tag}: page {} failed: {e}", self.pages + 1);
                self.state = CursorState::Failed;
                self.failure = Some(e.to_string());
                return Err(e.into());
            }
        };
        if !self.session.is_current() {
            debug!("session {tag}: discarding stale page of {} records", page.records.len());
            self.state = CursorState::Idle;
            return Err(CursorError::Superseded(tag));
        }

        self.pages += 1;
        self.failure = None;
        self.total = Some(page.total);
        let received = page.records.len();
        self.buffer.extend(page.records);
        match page.after {
            Some(after) if !after.is_null() && received > 0 => {
                self.request.after = Some(after);
                self.state = CursorState::HasMore;
            }
            _ => self.state = CursorState::Exhausted,
        }
        info!(
            "session {tag}: page {} brought {received} of {} records{}",
            self.pages,
            page.total,
            if self.state == CursorState::Exhausted {
                ", exhausted"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// Pull up to `batches` batches of records. Failures end the batch early
    /// and are left in [`failure`](Self::failure) instead of being returned.
    pub async fn fetch_batch(&mut self, batches: usize) -> Vec<RecordData> {
        let wanted = batches * self.batch_size;
        let mut records = Vec::with_capacity(wanted);
        while records.len() < wanted {
            match self.next().await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(CursorError::Superseded(tag)) => {
                    debug!("session {tag}: batch cut short");
                    break;
                }
                Err(CursorError::Api(_)) => break,
            }
        }
        records
    }

    /// Records as a stream that ends at exhaustion or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RecordData, CursorError>> {
        futures::stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next().await {
                Ok(Some(record)) => Some((Ok(record), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Number of matches for `body`, without fetching records.
    pub async fn count(portal: &dyn Portal, body: &RequestBody) -> Result<u64, ApiError> {
        let body = RequestBody {
            after: None,
            ..body.clone()
        }
        .with_size(0);
        Ok(portal.multisearch(&body).await?.total)
    }
}

/// Pulls distinct field values from `datastore_value_autocomplete`.
pub struct AutocompleteCursor {
    portal: Arc<dyn Portal>,
    request: AutocompleteRequest,
    buffer: VecDeque<Value>,
    done: bool,
}

impl AutocompleteCursor {
    pub fn new(
        portal: Arc<dyn Portal>,
        query: QueryBody,
        resource_ids: Vec<String>,
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            portal,
            request: AutocompleteRequest {
                query,
                resource_ids,
                field: field.into(),
                prefix: prefix.into(),
                after: None,
                size: None,
            },
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.request.size = Some(size);
        self
    }

    pub async fn next(&mut self) -> Result<Option<Value>, ApiError> {
        loop {
            if let Some(value) = self.buffer.pop_front() {
                return Ok(Some(value));
            }
            if self.done {
                return Ok(None);
            }
            let page = self.portal.value_autocomplete(&self.request).await?;
            debug!(
                "autocomplete {}: {} values",
                self.request.field,
                page.values.len()
            );
            if page.values.is_empty() {
                self.done = true;
                continue;
            }
            self.buffer.extend(page.values);
            match page.after {
                Some(after) if !after.is_null() => self.request.after = Some(after),
                _ => self.done = true,
            }
        }
    }

    pub async fn take(&mut self, limit: usize) -> Result<Vec<Value>, ApiError> {
        let mut values = Vec::new();
        while values.len() < limit {
            match self.next().await? {
                Some(value) => values.push(value),
                None => break,
            }
        }
        Ok(values)
    }
}
