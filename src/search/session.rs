//! Session tags. Every piece of async work is tagged with the session it was
//! started for and must check [`SessionHandle::is_current`] before writing
//! shared state. Starting a session cancels the previous one's token.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub query_hash: u64,
    /// Distinguishes re-runs of the same query.
    pub epoch: u64,
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}#{}", self.query_hash, self.epoch)
    }
}

#[derive(Debug)]
struct Current {
    tag: Option<SessionTag>,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct SessionTracker {
    epoch: AtomicU64,
    current: Mutex<Current>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            current: Mutex::new(Current {
                tag: None,
                token: CancellationToken::new(),
            }),
        }
    }
}

impl SessionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a new session current and cancel the one it replaces.
    pub fn begin(self: &Arc<Self>, query_hash: u64) -> SessionHandle {
        let tag = SessionTag {
            query_hash,
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let token = CancellationToken::new();
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = current.tag.replace(tag);
            std::mem::replace(&mut current.token, token.clone()).cancel();
            previous
        };
        if let Some(previous) = previous {
            debug!("session {previous} superseded by {tag}");
        } else {
            debug!("session {tag} opened");
        }
        SessionHandle {
            tag,
            token,
            tracker: Arc::clone(self),
        }
    }

    pub fn current(&self) -> Option<SessionTag> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tag
    }

    pub fn is_current(&self, tag: SessionTag) -> bool {
        self.current() == Some(tag)
    }

    /// End the current session without starting another.
    pub fn cancel(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.tag = None;
        current.token.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    tag: SessionTag,
    token: CancellationToken,
    tracker: Arc<SessionTracker>,
}

impl SessionHandle {
    pub fn tag(&self) -> SessionTag {
        self.tag
    }

    pub fn is_current(&self) -> bool {
        self.tracker.is_current(self.tag)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session has been superseded or cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
